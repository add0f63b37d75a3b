//! Daemon configuration: flags, defaults, and validation.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

pub const DEFAULT_SOCKPATH: &str = "/var/run/bookkeeper/bookkeeper.sock";
pub const DEFAULT_REACQUIRE_TIMEOUT_SECS: u64 = 7200;
pub const PRIVILEGED_PORT_CEILING: u16 = 1024;
pub const DEFAULT_SYS_UID_THRESHOLD: u32 = 1000;
pub const DEFAULT_PORT_OFFSET: u32 = 10000;
pub const RESOURCE_LIMIT_NOFILE: u64 = 70_000;
pub const REACQUIRE_INTERVAL_SECS: u64 = 60;
pub const LISTEN_BACKLOG: i32 = 5;

/// Accounts never eligible for a reservation, regardless of uid.
pub const USER_BLACKLIST: &[&str] = &["nfsnobody", "nobody"];

/// Raw command line flags for `bookkeeperd`.
#[derive(Parser, Debug)]
#[clap(name = "bookkeeperd", about = "Reserves TCP ports for local user accounts")]
pub struct Args {
    /// Accounts with a uid below this are never considered for reservation.
    #[clap(long = "sys-uid-threshold", default_value_t = DEFAULT_SYS_UID_THRESHOLD)]
    pub sys_uid_threshold: u32,

    /// Added to a user's uid to compute their reserved port.
    #[clap(long = "port-offset", default_value_t = DEFAULT_PORT_OFFSET)]
    pub port_offset: u32,

    /// User (and its primary group) to drop privileges to after startup.
    #[clap(long = "user")]
    pub user: String,

    /// Path of the control socket to create.
    #[clap(long = "sockpath", default_value = DEFAULT_SOCKPATH)]
    pub sockpath: PathBuf,

    /// Increase log verbosity; repeatable.
    #[clap(short = 'v', long = "verbose", parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port offset must be at least {PRIVILEGED_PORT_CEILING} (the privileged port ceiling), got {0}")]
    PortOffsetTooLow(u32),
    #[error("sockpath must be an absolute path, got {0:?}")]
    SockpathNotAbsolute(PathBuf),
    #[error("user {0:?} does not exist")]
    UnknownUser(String),
}

/// Validated, resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub sys_uid_threshold: u32,
    pub port_offset: u32,
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub sockpath: PathBuf,
    pub verbose: u8,
    pub account_file: PathBuf,
    pub account_dir: PathBuf,
}

impl Config {
    /// Validate raw `Args` and resolve `--user` to a `(uid, gid)` pair via
    /// the host account database.
    pub fn from_args(args: Args) -> Result<Config, ConfigError> {
        if args.port_offset < u32::from(PRIVILEGED_PORT_CEILING) {
            return Err(ConfigError::PortOffsetTooLow(args.port_offset));
        }
        if !args.sockpath.is_absolute() {
            return Err(ConfigError::SockpathNotAbsolute(args.sockpath));
        }
        let (uid, gid) = crate::accounts::resolve_user(&args.user)
            .ok_or_else(|| ConfigError::UnknownUser(args.user.clone()))?;

        Ok(Config {
            sys_uid_threshold: args.sys_uid_threshold,
            port_offset: args.port_offset,
            user: args.user,
            uid,
            gid,
            sockpath: args.sockpath,
            verbose: args.verbose,
            account_file: PathBuf::from("/etc/passwd"),
            account_dir: PathBuf::from("/etc"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_offset_below_privileged_ceiling_is_rejected() {
        let args = Args {
            sys_uid_threshold: DEFAULT_SYS_UID_THRESHOLD,
            port_offset: 80,
            user: "nobody".into(),
            sockpath: PathBuf::from(DEFAULT_SOCKPATH),
            verbose: 0,
        };
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::PortOffsetTooLow(80))
        ));
    }

    #[test]
    fn relative_sockpath_is_rejected() {
        let args = Args {
            sys_uid_threshold: DEFAULT_SYS_UID_THRESHOLD,
            port_offset: DEFAULT_PORT_OFFSET,
            user: "root".into(),
            sockpath: PathBuf::from("relative.sock"),
            verbose: 0,
        };
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::SockpathNotAbsolute(_))
        ));
    }
}
