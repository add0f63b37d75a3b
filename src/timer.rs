//! The periodic re-acquire timer, backed by `timerfd`, matching
//! `timer_setup`/`timer_read` in the original daemon.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A recurring `timerfd`, firing every `interval` once armed.
#[derive(Debug)]
pub struct Timer {
    fd: RawFd,
}

impl Timer {
    pub fn new(interval: Duration) -> io::Result<Timer> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: interval.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(interval.subsec_nanos()),
            },
            it_value: libc::timespec {
                tv_sec: interval.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(interval.subsec_nanos()),
            },
        };

        if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Timer { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Drain the expiration counter. Returns the number of intervals that
    /// elapsed since the last read (almost always 1).
    pub fn acknowledge(&self) -> io::Result<u64> {
        let mut expirations: u64 = 0;
        let buf = &mut expirations as *mut u64 as *mut libc::c_void;
        let n = unsafe { libc::read(self.fd, buf, mem::size_of::<u64>()) };
        match n {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(0)
                } else {
                    Err(err)
                }
            }
            _ => Ok(expirations),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } == -1 {
            let err = io::Error::last_os_error();
            log::warn!("error closing timerfd: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fires_after_the_configured_interval() {
        let timer = Timer::new(Duration::from_millis(20)).unwrap();
        sleep(Duration::from_millis(60));
        let expirations = timer.acknowledge().unwrap();
        assert!(expirations >= 1);
    }

    #[test]
    fn acknowledge_with_nothing_pending_is_zero() {
        let timer = Timer::new(Duration::from_secs(60)).unwrap();
        assert_eq!(timer.acknowledge().unwrap(), 0);
    }
}
