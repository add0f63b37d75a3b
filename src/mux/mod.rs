//! The event multiplexer.
//!
//! `Mux` is the single blocking point in the daemon: a thin, single-threaded
//! wrapper around `epoll` that dispatches readiness events to the handler
//! registered for each descriptor. Every other subsystem (the account-file
//! watcher, the signal channel, the periodic timer, the control socket, and
//! each accepted client connection) registers exactly one descriptor here
//! and is driven entirely from [`Mux::run`].

mod sys;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::{trace, warn};

bitflags::bitflags! {
    /// Readiness a caller wants to be notified about.
    pub struct Interest: u8 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
    }
}

bitflags::bitflags! {
    /// Readiness actually reported for a descriptor.
    pub struct Readiness: u8 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
        const ERROR    = 0b0000_0100;
        const HUP      = 0b0000_1000;
    }
}

impl Readiness {
    /// Whether this readiness event represents an error or hangup condition.
    /// Handlers return [`Outcome::Drop`] when this is true.
    pub fn is_error_or_hup(&self) -> bool {
        self.intersects(Readiness::ERROR | Readiness::HUP)
    }
}

/// What a handler wants done with its registration after dispatch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Leave the registration in place.
    Keep,
    /// Unregister the descriptor. The handler is dropped; closing the
    /// underlying descriptor, if any, is the handler's `Drop` impl's
    /// responsibility.
    Drop,
}

/// Something that can react to a readiness event for one descriptor.
///
/// A `Handler` owns whatever state it needs between calls directly,
/// rather than through an opaque pointer; there is no separate destructor
/// hook because dropping the boxed handler on unregistration plays that
/// role.
pub trait Handler {
    fn readiness(&mut self, fd: RawFd, readiness: Readiness) -> Outcome;
}

impl<F> Handler for F
where
    F: FnMut(RawFd, Readiness) -> Outcome,
{
    fn readiness(&mut self, fd: RawFd, readiness: Readiness) -> Outcome {
        (self)(fd, readiness)
    }
}

/// Error returned by [`Mux::register`].
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("multiplexer has reached its maximum of {0} registered descriptors")]
    Full(usize),
    #[error("kernel rejected registration: {0}")]
    Kernel(#[from] io::Error),
}

/// The event multiplexer.
pub struct Mux {
    selector: sys::Selector,
    handlers: HashMap<RawFd, Box<dyn Handler>>,
    event_buf: Vec<(RawFd, Readiness)>,
}

impl Mux {
    /// Create a new, empty multiplexer. Fails only if the kernel selector
    /// (`epoll_create1`) cannot be created.
    pub fn new() -> io::Result<Mux> {
        Ok(Mux {
            selector: sys::Selector::new()?,
            handlers: HashMap::new(),
            event_buf: Vec::new(),
        })
    }

    /// Register `fd` for `interest`, dispatching future readiness events to
    /// `handler`.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: impl Handler + 'static,
    ) -> Result<(), RegisterError> {
        if self.handlers.len() >= sys::MAX_DESCRIPTORS {
            return Err(RegisterError::Full(sys::MAX_DESCRIPTORS));
        }
        self.selector.register(fd, interest)?;
        trace!("registered fd {} with mux, interest {:?}", fd, interest);
        self.handlers.insert(fd, Box::new(handler));
        Ok(())
    }

    /// Change the readiness interest for an already-registered descriptor.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if !self.handlers.contains_key(&fd) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered"));
        }
        self.selector.reregister(fd, interest)
    }

    /// Unregister `fd`, idempotently. Dropping the stored handler is the
    /// only teardown this performs; closing the descriptor itself remains
    /// the handler's responsibility.
    pub fn unregister(&mut self, fd: RawFd) {
        if self.handlers.remove(&fd).is_none() {
            return;
        }
        if let Err(err) = self.selector.deregister(fd) {
            warn!("failed to deregister fd {} from epoll: {}", fd, err);
        }
    }

    /// Run a single pass: wait for up to `batch_max` ready descriptors (at
    /// most the multiplexer's hard cap) and dispatch each to its handler.
    /// Interrupted waits are restarted transparently. Returns the number of
    /// handlers invoked.
    pub fn run(&mut self, batch_max: usize, timeout: Option<Duration>) -> io::Result<usize> {
        loop {
            match self.selector.select(&mut self.event_buf, batch_max, timeout) {
                Ok(()) => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        let ready: Vec<(RawFd, Readiness)> = self.event_buf.drain(..).collect();
        let mut handled = 0;
        for (fd, readiness) in ready {
            let outcome = match self.handlers.get_mut(&fd) {
                Some(handler) => handler.readiness(fd, readiness),
                None => continue, // Spurious: already unregistered this pass.
            };
            handled += 1;
            if outcome == Outcome::Drop {
                self.unregister(fd);
            }
        }
        Ok(handled)
    }

    /// Number of descriptors currently registered.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    fn pipe() -> (std::fs::File, std::fs::File) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn register_and_dispatch_readable() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let (reader, mut writer) = pipe();
        let reader_fd = reader.as_raw_fd();

        let mut mux = Mux::new().unwrap();
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired_clone = fired.clone();
        mux.register(reader_fd, Interest::READABLE, move |_fd, readiness: Readiness| {
            assert!(readiness.contains(Readiness::READABLE));
            fired_clone.set(true);
            Outcome::Keep
        })
        .unwrap();

        writer.write_all(b"x").unwrap();
        let handled = mux.run(16, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(handled, 1);
        assert!(fired.get());
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn drop_outcome_unregisters() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let (reader, mut writer) = pipe();
        let reader_fd = reader.as_raw_fd();

        let mut mux = Mux::new().unwrap();
        mux.register(reader_fd, Interest::READABLE, |_fd, _readiness| Outcome::Drop)
            .unwrap();

        writer.write_all(b"x").unwrap();
        mux.run(16, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut mux = Mux::new().unwrap();
        mux.unregister(999);
        mux.unregister(999);
    }
}
