//! Delivering SIGHUP/SIGINT/SIGTERM through `signalfd` instead of a
//! traditional signal handler. Signals are blocked with `sigprocmask`
//! first so they only ever arrive through the fd the multiplexer polls.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// The three signals this daemon cares about.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Signal {
    Hup,
    Int,
    Term,
}

impl Signal {
    fn from_raw(signo: libc::c_int) -> Option<Signal> {
        match signo {
            libc::SIGHUP => Some(Signal::Hup),
            libc::SIGINT => Some(Signal::Int),
            libc::SIGTERM => Some(Signal::Term),
            _ => None,
        }
    }
}

/// A `signalfd`, already armed and with its signals blocked from default
/// delivery.
#[derive(Debug)]
pub struct Signals {
    fd: RawFd,
}

impl Signals {
    pub fn new() -> io::Result<Signals> {
        let set = create_sigset()?;

        if unsafe { libc::sigprocmask(libc::SIG_BLOCK, &set, ptr::null_mut()) } == -1 {
            return Err(io::Error::last_os_error());
        }

        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Signals { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read one pending signal, if any. `WouldBlock` (nothing pending) and
    /// unrecognized signal numbers both come back as `Ok(None)`.
    pub fn receive(&self) -> io::Result<Option<Signal>> {
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let buf = &mut info as *mut _ as *mut libc::c_void;
        let n = unsafe { libc::read(self.fd, buf, mem::size_of::<libc::signalfd_siginfo>()) };
        match n {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
            n if n as usize == mem::size_of::<libc::signalfd_siginfo>() => {
                Ok(Signal::from_raw(info.ssi_signo as libc::c_int))
            }
            _ => Ok(None),
        }
    }
}

impl Drop for Signals {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } == -1 {
            let err = io::Error::last_os_error();
            log::warn!("error closing signalfd: {}", err);
        }
    }
}

fn create_sigset() -> io::Result<libc::sigset_t> {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigemptyset(&mut set) } == -1 {
        return Err(io::Error::last_os_error());
    }
    for signo in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        if unsafe { libc::sigaddset(&mut set, signo) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_with_nothing_pending_is_none() {
        let signals = Signals::new().unwrap();
        assert_eq!(signals.receive().unwrap(), None);
    }

    #[test]
    fn sighup_is_delivered_through_the_fd() {
        let signals = Signals::new().unwrap();
        unsafe {
            libc::raise(libc::SIGHUP);
        }
        assert_eq!(signals.receive().unwrap(), Some(Signal::Hup));
    }
}
