//! The wire format shared by `bookkeeperd` and `portguard`: a fixed-layout,
//! native-endian, unpadded 20-byte request frame and a 6-byte response
//! header optionally followed by an array of 8-byte port entries. Mirrors
//! `protocol.h`/`protocol.c` byte-for-byte.

use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

pub const MAGIC: u32 = 0x504F_5254;

pub const REQUEST_LEN: usize = 20;
pub const RESPONSE_HEADER_LEN: usize = 6;
pub const PORT_ENTRY_LEN: usize = 8;

pub const STATUS_RESERVED: u8 = 0;
pub const STATUS_RELEASED: u8 = 1;
pub const STATUS_UNKNOWN: u8 = 2;

pub const REACQUIRE_DO: u8 = 0;
pub const REACQUIRE_DONT: u8 = 1;
pub const REACQUIRE_UNKNOWN: u8 = 2;

/// A decoded opcode, or the raw value if it wasn't one of the four known
/// commands (the server responds `INVALID_ARGUMENT` to those).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Reserve,
    Release,
    Policy,
    List,
}

impl Opcode {
    pub fn from_raw(value: u32) -> Option<Opcode> {
        match value {
            0 => Some(Opcode::Reserve),
            1 => Some(Opcode::Release),
            2 => Some(Opcode::Policy),
            3 => Some(Opcode::List),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Opcode::Reserve => 0,
            Opcode::Release => 1,
            Opcode::Policy => 2,
            Opcode::List => 3,
        }
    }
}

/// A decoded request frame, plus the raw opcode (kept even when it doesn't
/// map to a known `Opcode`, so the caller can report `INVALID_ARGUMENT`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Request {
    pub opcode_raw: u32,
    pub uid: u32,
    pub port: u16,
    pub suppress_reacquire: u8,
}

impl Request {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.opcode_raw)
    }

    /// Serialize for sending by a client, matching `fill_request_vector`'s
    /// field order: magic, request, uid, port, status, suppress_reacquire,
    /// error.
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        let mut w = &mut buf[..];
        w.write_all(&MAGIC.to_ne_bytes()).unwrap();
        w.write_all(&self.opcode_raw.to_ne_bytes()).unwrap();
        w.write_all(&self.uid.to_ne_bytes()).unwrap();
        w.write_all(&self.port.to_ne_bytes()).unwrap();
        w.write_all(&[0u8]).unwrap(); // status, unused on requests
        w.write_all(&[self.suppress_reacquire]).unwrap();
        w.write_all(&0i32.to_ne_bytes()).unwrap(); // error, unused on requests
        buf
    }

    /// Parse a frame already read off the wire. Returns `None` if the magic
    /// doesn't match, which callers must treat as "drop the connection
    /// silently".
    fn decode(buf: &[u8; REQUEST_LEN]) -> Option<Request> {
        let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return None;
        }
        let opcode_raw = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
        let uid = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
        let port = u16::from_ne_bytes(buf[12..14].try_into().unwrap());
        let suppress_reacquire = buf[15];
        Some(Request {
            opcode_raw,
            uid,
            port,
            suppress_reacquire,
        })
    }
}

/// The peer credentials a client's connection arrived with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PeerCredentials {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// The outcome of reading one request frame off an accepted connection.
#[derive(Debug)]
pub enum Recv {
    /// A well-formed frame with attached credentials.
    Request(Request, PeerCredentials),
    /// Bad magic value, no credentials attached, or a zero peer pid: per
    /// spec, the connection is dropped without logging anything.
    Silent,
    /// Fewer than `REQUEST_LEN` bytes arrived (a half-sent frame, or the
    /// peer closed early): the caller must log and close the connection.
    Truncated,
}

/// Read exactly one request frame plus its `SCM_CREDENTIALS` ancillary
/// data from an already-accepted connection.
pub fn recv_request(fd: RawFd) -> io::Result<Recv> {
    let mut frame_buf = [0u8; REQUEST_LEN];
    let mut cmsg_buf = [0u8; 64];

    let mut iov = libc::iovec {
        iov_base: frame_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: frame_buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != REQUEST_LEN {
        return Ok(Recv::Truncated);
    }

    let creds = unsafe { extract_credentials(&msg) };
    let creds = match creds {
        Some(creds) if creds.pid != 0 => creds,
        _ => return Ok(Recv::Silent),
    };

    Ok(match Request::decode(&frame_buf) {
        Some(request) => Recv::Request(request, creds),
        None => Recv::Silent,
    })
}

/// # Safety
///
/// `msg` must have just been filled in by a successful `recvmsg` call
/// using `cmsg_buf` as its control buffer.
unsafe fn extract_credentials(msg: &libc::msghdr) -> Option<PeerCredentials> {
    let cmsg = libc::CMSG_FIRSTHDR(msg);
    if cmsg.is_null() {
        return None;
    }
    if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_CREDENTIALS {
        return None;
    }
    let ucred = *(libc::CMSG_DATA(cmsg) as *const libc::ucred);
    Some(PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

/// The fixed response header: `{error, ports_len}`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResponseHeader {
    pub error: u32,
    pub ports_len: u16,
}

impl ResponseHeader {
    pub fn ok(ports_len: u16) -> ResponseHeader {
        ResponseHeader { error: 0, ports_len }
    }

    pub fn err(error: u32) -> ResponseHeader {
        ResponseHeader { error, ports_len: 0 }
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.error.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.ports_len.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_HEADER_LEN]) -> ResponseHeader {
        ResponseHeader {
            error: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            ports_len: u16::from_ne_bytes(buf[4..6].try_into().unwrap()),
        }
    }
}

/// One entry of a `LIST` response body.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PortEntry {
    pub uid: u32,
    pub port: u16,
    pub status: u8,
    pub suppress_reacquire: u8,
}

impl PortEntry {
    pub fn encode(&self) -> [u8; PORT_ENTRY_LEN] {
        let mut buf = [0u8; PORT_ENTRY_LEN];
        buf[0..4].copy_from_slice(&self.uid.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.port.to_ne_bytes());
        buf[6] = self.status;
        buf[7] = self.suppress_reacquire;
        buf
    }

    pub fn decode(buf: &[u8; PORT_ENTRY_LEN]) -> PortEntry {
        PortEntry {
            uid: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            port: u16::from_ne_bytes(buf[4..6].try_into().unwrap()),
            status: buf[6],
            suppress_reacquire: buf[7],
        }
    }
}

/// Client-side helper: send one request and read the response, used by
/// `portguard`. Not used by the daemon, which must avoid blocking sends.
pub fn roundtrip(
    stream: &mut UnixStream,
    request: &Request,
) -> io::Result<(ResponseHeader, Vec<PortEntry>)> {
    stream.write_all(&request.encode())?;

    let mut header_buf = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut header_buf)?;
    let header = ResponseHeader::decode(&header_buf);

    if header.error != 0 || header.ports_len == 0 {
        return Ok((header, Vec::new()));
    }

    let mut entries = Vec::with_capacity(header.ports_len as usize);
    for _ in 0..header.ports_len {
        let mut entry_buf = [0u8; PORT_ENTRY_LEN];
        stream.read_exact(&mut entry_buf)?;
        entries.push(PortEntry::decode(&entry_buf));
    }
    Ok((header, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_encode_decode() {
        let request = Request {
            opcode_raw: Opcode::Release.to_raw(),
            uid: 1001,
            port: 0,
            suppress_reacquire: 0,
        };
        let encoded = request.encode();
        let decoded = Request::decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn bad_magic_decodes_to_none() {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&0u32.to_ne_bytes());
        assert!(Request::decode(&buf).is_none());
    }

    #[test]
    fn response_header_round_trips() {
        let header = ResponseHeader::ok(3);
        assert_eq!(ResponseHeader::decode(&header.encode()), header);
    }

    #[test]
    fn port_entry_round_trips() {
        let entry = PortEntry {
            uid: 1002,
            port: 11002,
            status: STATUS_RESERVED,
            suppress_reacquire: REACQUIRE_DO,
        };
        assert_eq!(PortEntry::decode(&entry.encode()), entry);
    }
}
