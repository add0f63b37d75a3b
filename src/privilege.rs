//! Resource-limit and privilege-drop startup steps, matching
//! `set_resource_limits`/`switch_users` in the original daemon.

use std::io;

use crate::config::RESOURCE_LIMIT_NOFILE;

/// Raise `RLIMIT_NOFILE` so one socket per eligible account is always
/// feasible, regardless of the number of local accounts.
pub fn raise_file_limit() -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: RESOURCE_LIMIT_NOFILE,
        rlim_max: RESOURCE_LIMIT_NOFILE,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drop from the starting (root) identity to `(uid, gid)` permanently,
/// group first then user so the process never holds a user identity
/// with leftover group privileges.
pub fn drop_privileges(uid: u32, gid: u32) -> io::Result<()> {
    if unsafe { libc::setregid(gid, gid) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::setreuid(uid, uid) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
