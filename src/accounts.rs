//! Host account database access.
//!
//! Mirrors the original daemon's direct use of `getpwent(3)`/`getpwnam(3)`/
//! `getpwuid(3)`: no higher-level `users`/`uzers` crate, since those wrap the
//! identical libc calls while giving up control over the scan's lifetime
//! (the whole point of `getpwent`/`endpwent` pairing below).

use std::ffi::{CStr, CString};

/// One entry from the host account database, as far as this daemon cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
}

/// Scan the entire account database from the start, returning every entry.
///
/// Uses `getpwent`/`endpwent`; this is not reentrant with respect to other
/// callers of the same functions, which is fine because the daemon is
/// single-threaded and never nests scans.
pub fn scan() -> Vec<Account> {
    let mut accounts = Vec::new();
    unsafe {
        libc::setpwent();
        loop {
            let entry = libc::getpwent();
            if entry.is_null() {
                break;
            }
            if let Some(account) = account_from_passwd(entry) {
                accounts.push(account);
            }
        }
        libc::endpwent();
    }
    accounts
}

/// Look up a single account by uid, for checking whether it still exists.
pub fn by_uid(uid: u32) -> Option<Account> {
    unsafe {
        let entry = libc::getpwuid(uid);
        if entry.is_null() {
            None
        } else {
            account_from_passwd(entry)
        }
    }
}

/// Resolve a username to `(uid, gid)`, used for `--user` at startup.
pub fn resolve_user(name: &str) -> Option<(u32, u32)> {
    let cname = CString::new(name).ok()?;
    unsafe {
        let entry = libc::getpwnam(cname.as_ptr());
        if entry.is_null() {
            None
        } else {
            Some(((*entry).pw_uid, (*entry).pw_gid))
        }
    }
}

/// # Safety
///
/// `entry` must be a valid, non-null `*mut libc::passwd` as returned by one
/// of the `getpw*` family, pointing to storage valid only until the next
/// call into that family.
unsafe fn account_from_passwd(entry: *mut libc::passwd) -> Option<Account> {
    let name_ptr = (*entry).pw_name;
    if name_ptr.is_null() {
        return None;
    }
    let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
    Some(Account {
        name,
        uid: (*entry).pw_uid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_account_resolves() {
        // Every POSIX host has a uid 0 account; this exercises the FFI path
        // without depending on any account beyond root existing.
        let root = by_uid(0);
        assert!(root.is_some());
        assert_eq!(root.unwrap().uid, 0);
    }
}
