//! Watching the host account database for changes, matching
//! `inotify_setup`/`inotify_read` in the original daemon.
//!
//! Two watches are kept: one on the containing directory (to catch editors
//! that write a new file and rename it over the original, which never
//! triggers `IN_MODIFY` on the original inode) and one directly on the
//! account file (to catch in-place edits). The directory watch also exists
//! because the file watch is invalidated (`IN_IGNORED`) whenever the
//! watched file is replaced, and must be re-armed against the new inode.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;

use log::warn;

const EVENT_BUF_LEN: usize = 4096;

/// Whether a batch of inotify events indicates the account database should
/// be re-synced.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Changed(pub bool);

pub struct Watch {
    fd: RawFd,
    dir_wd: libc::c_int,
    file_wd: libc::c_int,
    file_name: CString,
    file_path: CString,
}

impl Watch {
    /// Start watching `account_dir` (e.g. `/etc`) for renames that
    /// overwrite `account_file`'s basename, and `account_file` itself
    /// (e.g. `/etc/passwd`) for in-place edits.
    pub fn new(account_dir: &Path, account_file: &Path) -> io::Result<Watch> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let dir_path = path_to_cstring(account_dir)?;
        let file_path = path_to_cstring(account_file)?;
        let file_name = account_file
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| CString::new(name).ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "account file has no basename"))?;

        let dir_wd = unsafe { libc::inotify_add_watch(fd, dir_path.as_ptr(), libc::IN_MOVED_TO) };
        if dir_wd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let file_wd = unsafe { libc::inotify_add_watch(fd, file_path.as_ptr(), libc::IN_MODIFY) };
        if file_wd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Watch {
            fd,
            dir_wd,
            file_wd,
            file_name,
            file_path,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read and classify every pending event. Re-arms the file watch if the
    /// kernel invalidated it (the file was replaced, e.g. by a rename over
    /// it), logging and giving up on this watch only if re-arming fails.
    pub fn read(&mut self) -> io::Result<Changed> {
        let mut buf = [0u8; EVENT_BUF_LEN];
        let n = unsafe {
            libc::read(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Changed(false));
            }
            return Err(err);
        }

        let mut changed = false;
        let mut offset = 0usize;
        let header_len = mem::size_of::<libc::inotify_event>();
        while offset + header_len <= n as usize {
            let event = unsafe { &*(buf.as_ptr().add(offset) as *const libc::inotify_event) };
            let name_len = event.len as usize;

            if event.wd == self.dir_wd {
                let matches_basename = self.event_name(&buf, offset, name_len)
                    == self.file_name.to_str().ok();
                if (event.mask & libc::IN_MOVED_TO) != 0 && matches_basename {
                    changed = true;
                }
            } else if event.wd == self.file_wd {
                if (event.mask & libc::IN_MODIFY) != 0 {
                    changed = true;
                }
                if (event.mask & libc::IN_IGNORED) != 0 {
                    self.rearm_file_watch();
                }
            } else {
                warn!("unknown inotify watch descriptor {} reported an event", event.wd);
            }

            offset += header_len + name_len;
        }

        Ok(Changed(changed))
    }

    fn event_name<'a>(&self, buf: &'a [u8], offset: usize, name_len: usize) -> Option<&'a str> {
        if name_len == 0 {
            return None;
        }
        let header_len = mem::size_of::<libc::inotify_event>();
        let name_bytes = &buf[offset + header_len..offset + header_len + name_len];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_len);
        std::str::from_utf8(&name_bytes[..nul]).ok()
    }

    fn rearm_file_watch(&mut self) {
        let wd = unsafe { libc::inotify_add_watch(self.fd, self.file_path.as_ptr(), libc::IN_MODIFY) };
        if wd == -1 {
            let err = io::Error::last_os_error();
            warn!("failed to re-arm watch on account file: {}", err);
        } else {
            self.file_wd = wd;
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } == -1 {
            let err = io::Error::last_os_error();
            warn!("error closing inotify fd: {}", err);
        }
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    let s = path
        .to_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8"))?;
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}
