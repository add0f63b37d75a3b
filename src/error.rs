//! Error types.
//!
//! `DaemonError` covers the fatal bucket: anything that fails before the
//! event loop starts. `PortError` covers the bucket surfaced to clients:
//! every port operation's failure is encoded as the absolute value of a
//! standard errno-shaped code in the wire response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to raise open file limit: {0}")]
    ResourceLimit(std::io::Error),

    #[error("failed to drop privileges to {user:?}: {source}")]
    PrivilegeDrop {
        user: String,
        source: std::io::Error,
    },

    #[error("failed to create account-database watch: {0}")]
    Watch(std::io::Error),

    #[error("failed to create signal channel: {0}")]
    Signals(std::io::Error),

    #[error("failed to create control socket listener: {0}")]
    ControlSocket(std::io::Error),

    #[error("failed to create periodic timer: {0}")]
    Timer(std::io::Error),

    #[error("failed to allocate the event multiplexer: {0}")]
    Mux(std::io::Error),

    #[error("failed to register {what} with the event multiplexer: {source}")]
    Register {
        what: &'static str,
        source: crate::mux::RegisterError,
    },
}

/// The error taxonomy for port operations.
///
/// Each variant knows the absolute value of the numeric code it is encoded
/// as on the wire. `Errno` carries a raw OS error straight through from a
/// failed `bind(2)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum PortError {
    #[error("no reservation for that user")]
    NotFound,
    #[error("port does not match the stored reservation")]
    InvalidArgument,
    #[error("port is already held")]
    AddressInUse,
    #[error("port is not currently held")]
    NotConnected,
    #[error("caller is not authorized for that user")]
    PermissionDenied,
    #[error("OS error {0}")]
    Errno(i32),
}

impl PortError {
    /// The unsigned wire value: `error = |numeric code|`.
    pub fn wire_code(self) -> u32 {
        let code = match self {
            PortError::NotFound => libc::ENOENT,
            PortError::InvalidArgument => libc::EINVAL,
            PortError::AddressInUse => libc::EADDRINUSE,
            PortError::NotConnected => libc::ENOTCONN,
            PortError::PermissionDenied => libc::EPERM,
            PortError::Errno(errno) => errno,
        };
        code.unsigned_abs()
    }
}
