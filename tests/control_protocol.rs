//! End-to-end exercise of the control protocol's credential-passing path:
//! a real client process (this test binary) talks to a real accepted
//! connection over an actual `AF_UNIX` socket pair, so the `SCM_CREDENTIALS`
//! ancillary data decoded by `recv_request` comes from the kernel, not a
//! fabricated `ucred`.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};

use bookkeeper::control::protocol::{self, Opcode, Recv, Request};

fn passcred(stream: &UnixStream) {
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of_val(&enable) as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

#[test]
fn request_arrives_with_real_peer_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let sockpath = dir.path().join("control.sock");

    let listener = UnixListener::bind(&sockpath).unwrap();
    let mut client = UnixStream::connect(&sockpath).unwrap();
    let (server, _addr) = listener.accept().unwrap();
    passcred(&server);

    let request = Request {
        opcode_raw: Opcode::List.to_raw(),
        uid: unsafe { libc::getuid() },
        port: 0,
        suppress_reacquire: 0,
    };
    client.write_all(&request.encode()).unwrap();

    let (decoded, creds) = match protocol::recv_request(server.as_raw_fd()).unwrap() {
        Recv::Request(request, creds) => (request, creds),
        other => panic!("expected a well-formed request with credentials, got {:?}", other),
    };

    assert_eq!(decoded, request);
    assert_eq!(creds.uid, unsafe { libc::getuid() });
    assert_eq!(creds.pid, std::process::id() as libc::pid_t);
}

#[test]
fn bad_magic_is_silently_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let sockpath = dir.path().join("control.sock");

    let listener = UnixListener::bind(&sockpath).unwrap();
    let mut client = UnixStream::connect(&sockpath).unwrap();
    let (server, _addr) = listener.accept().unwrap();
    passcred(&server);

    let mut garbage = [0u8; protocol::REQUEST_LEN];
    garbage[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_ne_bytes());
    client.write_all(&garbage).unwrap();

    let result = protocol::recv_request(server.as_raw_fd()).unwrap();
    assert!(matches!(result, Recv::Silent));
}

#[test]
fn truncated_frame_is_reported_as_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let sockpath = dir.path().join("control.sock");

    let listener = UnixListener::bind(&sockpath).unwrap();
    let mut client = UnixStream::connect(&sockpath).unwrap();
    let (server, _addr) = listener.accept().unwrap();
    passcred(&server);

    // Send fewer bytes than REQUEST_LEN and close, simulating a half-sent
    // frame or an early peer close.
    let half = [0u8; protocol::REQUEST_LEN / 2];
    client.write_all(&half).unwrap();
    drop(client);

    let result = protocol::recv_request(server.as_raw_fd()).unwrap();
    assert!(matches!(result, Recv::Truncated));
}
