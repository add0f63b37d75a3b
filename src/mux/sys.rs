//! Raw `epoll` backed selector.
//!
//! Direct `libc` calls, `io::Result` at every FFI boundary, nothing hidden
//! behind an extra abstraction layer.

use std::cmp::min;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;
use std::io;

use log::error;

use crate::mux::{Interest, Readiness};

/// Hard cap on the number of descriptors a single [`Selector`] will track,
/// matching the multiplexer's `EVENT_MAXFDS`.
pub const MAX_DESCRIPTORS: usize = 1_048_576;

#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Selector { epfd })
        }
    }

    /// Wait for readiness events, appending up to `cap` of them to `events`.
    pub fn select(
        &self,
        events: &mut Vec<(RawFd, Readiness)>,
        cap: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();
        let cap = min(cap, MAX_DESCRIPTORS);
        let mut ep_events: Vec<libc::epoll_event> = Vec::with_capacity(cap);
        let timeout_ms = timeout.map(duration_to_millis).unwrap_or(-1);

        let n_events = unsafe {
            libc::epoll_wait(
                self.epfd,
                ep_events.as_mut_ptr(),
                cap as libc::c_int,
                timeout_ms,
            )
        };
        match n_events {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(()),
            n => {
                unsafe { ep_events.set_len(n as usize) };
                events.extend(ep_events.iter().map(ep_event_to_readiness));
                Ok(())
            }
        }
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = new_epoll_event(fd, interest);
        epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event)
    }

    pub fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = new_epoll_event(fd, interest);
        epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())
    }
}

const MILLIS_PER_SEC: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

fn duration_to_millis(duration: Duration) -> libc::c_int {
    let millis = duration
        .as_secs()
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add((duration.subsec_nanos() as u64 / NANOS_PER_MILLI) + 1);
    min(millis, libc::c_int::max_value() as u64) as libc::c_int
}

fn ep_event_to_readiness(ep_event: &libc::epoll_event) -> (RawFd, Readiness) {
    let fd = ep_event.u64 as RawFd;
    let epoll = ep_event.events;
    let mut readiness = Readiness::empty();

    if contains_flag(epoll, libc::EPOLLIN | libc::EPOLLPRI) {
        readiness |= Readiness::READABLE;
    }
    if contains_flag(epoll, libc::EPOLLOUT) {
        readiness |= Readiness::WRITABLE;
    }
    if contains_flag(epoll, libc::EPOLLERR) {
        readiness |= Readiness::ERROR;
    }
    if contains_flag(epoll, libc::EPOLLRDHUP | libc::EPOLLHUP) {
        readiness |= Readiness::HUP;
    }

    (fd, readiness)
}

fn contains_flag(flags: u32, flag: libc::c_int) -> bool {
    (flags & flag as u32) != 0
}

fn new_epoll_event(fd: RawFd, interest: Interest) -> libc::epoll_event {
    let mut events = libc::EPOLLPRI | libc::EPOLLRDHUP;
    if interest.contains(Interest::READABLE) {
        events |= libc::EPOLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::EPOLLOUT;
    }
    libc::epoll_event {
        events: events as u32,
        u64: fd as u64,
    }
}

fn epoll_ctl(
    epfd: RawFd,
    op: libc::c_int,
    fd: RawFd,
    event: *mut libc::epoll_event,
) -> io::Result<()> {
    if unsafe { libc::epoll_ctl(epfd, op, fd, event) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            let err = io::Error::last_os_error();
            error!("error closing epoll descriptor: {}", err);
        }
    }
}
