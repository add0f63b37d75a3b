//! Startup sequencing and the wiring between every subsystem: resource
//! limits, privilege drop, the four event sources, an initial `sync`,
//! then the event loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{Config, DEFAULT_REACQUIRE_TIMEOUT_SECS, REACQUIRE_INTERVAL_SECS};
use crate::control::{self, ControlSocket};
use crate::error::DaemonError;
use crate::mux::{Interest, Mux, Outcome, Readiness};
use crate::privilege;
use crate::reservation::Table;
use crate::signals::{self, Signals};
use crate::timer::Timer;
use crate::watch::Watch;

/// The running daemon. Owns the multiplexer and every long-lived
/// descriptor; everything else is reached through handlers registered
/// with the multiplexer at construction time.
pub struct Daemon {
    mux: Mux,
    table: Rc<RefCell<Table>>,
    pending_accepts: Rc<RefCell<VecDeque<RawFd>>>,
    shutdown: Rc<RefCell<Option<i32>>>,
}

impl Daemon {
    /// Run every startup step in order and wire up the four event
    /// sources. Returns an already-reconciled daemon ready for `run`.
    pub fn start(config: Config) -> Result<Daemon, DaemonError> {
        privilege::raise_file_limit().map_err(DaemonError::ResourceLimit)?;
        privilege::drop_privileges(config.uid, config.gid).map_err(|source| {
            DaemonError::PrivilegeDrop {
                user: config.user.clone(),
                source,
            }
        })?;

        let watch = Watch::new(&config.account_dir, &config.account_file).map_err(DaemonError::Watch)?;
        let signals = Signals::new().map_err(DaemonError::Signals)?;
        let control = ControlSocket::bind(&config.sockpath).map_err(DaemonError::ControlSocket)?;
        let timer = Timer::new(Duration::from_secs(REACQUIRE_INTERVAL_SECS)).map_err(DaemonError::Timer)?;
        let mut mux = Mux::new().map_err(DaemonError::Mux)?;

        let table = Rc::new(RefCell::new(Table::new(
            &config,
            Duration::from_secs(DEFAULT_REACQUIRE_TIMEOUT_SECS),
        )));
        let pending_accepts = Rc::new(RefCell::new(VecDeque::new()));
        let shutdown = Rc::new(RefCell::new(None));

        register_watch(&mut mux, watch, Rc::clone(&table)).map_err(|source| DaemonError::Register {
            what: "account-database watch",
            source,
        })?;
        register_signals(&mut mux, signals, Rc::clone(&table), Rc::clone(&shutdown)).map_err(|source| {
            DaemonError::Register {
                what: "signal channel",
                source,
            }
        })?;
        register_timer(&mut mux, timer, Rc::clone(&table)).map_err(|source| DaemonError::Register {
            what: "periodic timer",
            source,
        })?;
        register_control(&mut mux, control, Rc::clone(&pending_accepts)).map_err(|source| {
            DaemonError::Register {
                what: "control socket listener",
                source,
            }
        })?;

        table.borrow_mut().sync();
        info!("startup reconciliation complete: {} reservation(s)", table.borrow().len());

        Ok(Daemon {
            mux,
            table,
            pending_accepts,
            shutdown,
        })
    }

    /// Drive the daemon until a termination signal is observed. Returns
    /// the process exit status to use.
    pub fn run(&mut self) -> i32 {
        loop {
            if let Err(err) = self.mux.run(128, None) {
                warn!("event multiplexer wait failed: {}", err);
                continue;
            }

            for fd in self.pending_accepts.borrow_mut().drain(..).collect::<Vec<_>>() {
                let table = Rc::clone(&self.table);
                if let Err(err) = self.mux.register(fd, Interest::READABLE, move |fd, readiness: Readiness| {
                    if !readiness.is_error_or_hup() {
                        control::server::handle_connection(fd, &mut table.borrow_mut());
                    } else if unsafe { libc::close(fd) } == -1 {
                        warn!("error closing control connection: {}", std::io::Error::last_os_error());
                    }
                    Outcome::Drop
                }) {
                    warn!("failed to register accepted connection: {}", err);
                }
            }

            if let Some(status) = *self.shutdown.borrow() {
                return status;
            }
        }
    }
}

fn register_watch(
    mux: &mut Mux,
    mut watch: Watch,
    table: Rc<RefCell<Table>>,
) -> Result<(), crate::mux::RegisterError> {
    let fd = watch.as_raw_fd();
    mux.register(fd, Interest::READABLE, move |_fd, readiness: Readiness| {
        if readiness.is_error_or_hup() {
            return Outcome::Drop;
        }
        match watch.read() {
            Ok(changed) if changed.0 => table.borrow_mut().sync(),
            Ok(_) => {}
            Err(err) => warn!("error reading account-database watch: {}", err),
        }
        Outcome::Keep
    })
}

fn register_signals(
    mux: &mut Mux,
    signals: Signals,
    table: Rc<RefCell<Table>>,
    shutdown: Rc<RefCell<Option<i32>>>,
) -> Result<(), crate::mux::RegisterError> {
    let fd = signals.as_raw_fd();
    mux.register(fd, Interest::READABLE, move |_fd, readiness: Readiness| {
        if readiness.is_error_or_hup() {
            return Outcome::Drop;
        }
        loop {
            match signals.receive() {
                Ok(Some(signals::Signal::Hup)) => {
                    warn!("received SIGHUP, forcing reconciliation");
                    table.borrow_mut().sync();
                }
                Ok(Some(signals::Signal::Int)) | Ok(Some(signals::Signal::Term)) => {
                    *shutdown.borrow_mut() = Some(0);
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("error reading signalfd: {}", err);
                    break;
                }
            }
        }
        Outcome::Keep
    })
}

fn register_timer(mux: &mut Mux, timer: Timer, table: Rc<RefCell<Table>>) -> Result<(), crate::mux::RegisterError> {
    let fd = timer.as_raw_fd();
    mux.register(fd, Interest::READABLE, move |_fd, readiness: Readiness| {
        if readiness.is_error_or_hup() {
            return Outcome::Drop;
        }
        match timer.acknowledge() {
            Ok(_) => table.borrow_mut().reacquire_due(Instant::now()),
            Err(err) => warn!("error reading periodic timer: {}", err),
        }
        Outcome::Keep
    })
}

fn register_control(
    mux: &mut Mux,
    control: ControlSocket,
    pending_accepts: Rc<RefCell<VecDeque<RawFd>>>,
) -> Result<(), crate::mux::RegisterError> {
    let fd = control.as_raw_fd();
    mux.register(fd, Interest::READABLE, move |_fd, readiness: Readiness| {
        if readiness.is_error_or_hup() {
            return Outcome::Drop;
        }
        loop {
            match control.accept() {
                Ok(Some(conn_fd)) => pending_accepts.borrow_mut().push_back(conn_fd),
                Ok(None) => break,
                Err(err) => {
                    warn!("error accepting control connection: {}", err);
                    break;
                }
            }
        }
        Outcome::Keep
    })
}
