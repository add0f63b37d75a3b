//! Accepting connections on the control socket and dispatching decoded
//! requests to the reservation table. Mirrors `sockfile_setup`/
//! `sockfile_read` and `handle_request` in the original daemon.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;

use log::warn;

use crate::config::LISTEN_BACKLOG;
use crate::control::protocol::{self, Opcode, PortEntry, Recv, Request, ResponseHeader};
use crate::reservation::{PortInfo, Table, VisibleReacquire, VisibleStatus};

/// The listening control socket itself. Holds no per-connection state;
/// each accepted connection is handled and closed independently.
pub struct ControlSocket {
    fd: RawFd,
}

impl ControlSocket {
    pub fn bind(path: &Path) -> io::Result<ControlSocket> {
        let path_str = path
            .to_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "sockpath is not valid UTF-8"))?;
        if path_str.len() >= mem::size_of::<libc::sockaddr_un>() - mem::size_of::<libc::sa_family_t>() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "sockpath is too long"));
        }

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let passcred: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &passcred as *const _ as *const libc::c_void,
                mem::size_of_val(&passcred) as libc::socklen_t,
            )
        } == -1
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // A stale socket file from a previous run is fine to remove.
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(path_str.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        if let Err(err) = std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(0o777)) {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(ControlSocket { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Accept one pending connection. `Ok(None)` means nothing was
    /// pending (`EAGAIN`/`EWOULDBLOCK`).
    pub fn accept(&self) -> io::Result<Option<RawFd>> {
        let fd = unsafe { libc::accept4(self.fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(fd))
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } == -1 {
            let err = io::Error::last_os_error();
            warn!("error closing control socket: {}", err);
        }
    }
}

/// Handle one accepted connection to completion: read its single request,
/// dispatch it, send the response, and close it. Matches `decode_packet`'s
/// "one request per connection" contract.
pub fn handle_connection(fd: RawFd, table: &mut Table) {
    match protocol::recv_request(fd) {
        Ok(Recv::Request(request, creds)) => {
            let (header, entries) = dispatch(&request, creds.uid, table);
            send_response(fd, &header, &entries);
        }
        Ok(Recv::Silent) => {
            // Bad magic, missing credentials, or pid 0: silent drop.
        }
        Ok(Recv::Truncated) => {
            warn!("truncated control request on fd {}", fd);
        }
        Err(err) => {
            warn!("error reading control request: {}", err);
        }
    }
    if unsafe { libc::close(fd) } == -1 {
        let err = io::Error::last_os_error();
        warn!("error closing control connection: {}", err);
    }
}

fn dispatch(request: &Request, caller_uid: u32, table: &mut Table) -> (ResponseHeader, Vec<PortEntry>) {
    match request.opcode() {
        Some(Opcode::Reserve) => {
            let result = table.request(caller_uid, request.uid, request.port);
            (header_for(result.err().map(|e| e.wire_code())), Vec::new())
        }
        Some(Opcode::Release) => {
            let result = table.release(caller_uid, request.uid, request.port);
            (header_for(result.err().map(|e| e.wire_code())), Vec::new())
        }
        Some(Opcode::Policy) => {
            let suppress = request.suppress_reacquire != 0;
            let result = table.set_policy(caller_uid, request.uid, suppress);
            (header_for(result.err().map(|e| e.wire_code())), Vec::new())
        }
        Some(Opcode::List) => {
            let entries: Vec<PortEntry> = table.list(caller_uid).iter().map(to_wire_entry).collect();
            (ResponseHeader::ok(entries.len() as u16), entries)
        }
        None => (ResponseHeader::err(libc::EINVAL as u32), Vec::new()),
    }
}

fn header_for(error: Option<u32>) -> ResponseHeader {
    match error {
        None => ResponseHeader::ok(0),
        Some(code) => ResponseHeader::err(code),
    }
}

fn to_wire_entry(info: &PortInfo) -> PortEntry {
    PortEntry {
        uid: info.uid,
        port: info.port,
        status: match info.status {
            VisibleStatus::Reserved => protocol::STATUS_RESERVED,
            VisibleStatus::Released => protocol::STATUS_RELEASED,
            VisibleStatus::Unknown => protocol::STATUS_UNKNOWN,
        },
        suppress_reacquire: match info.suppress_reacquire {
            VisibleReacquire::Do => protocol::REACQUIRE_DO,
            VisibleReacquire::Dont => protocol::REACQUIRE_DONT,
            VisibleReacquire::Unknown => protocol::REACQUIRE_UNKNOWN,
        },
    }
}

fn send_response(fd: RawFd, header: &ResponseHeader, entries: &[PortEntry]) {
    if let Err(err) = send_all(fd, &header.encode()) {
        warn!("failed to send control response header: {}", err);
        return;
    }
    for entry in entries {
        if let Err(err) = send_all(fd, &entry.encode()) {
            warn!("failed to send control response entry: {}", err);
            return;
        }
    }
}

fn send_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
    if n == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
