//! `bookkeeperd`: the port-reservation daemon's entry point.

use std::process::ExitCode;

use clap::Parser;
use log::error;

use bookkeeper::config::{Args, Config};
use bookkeeper::daemon::Daemon;

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = std::env::set_current_dir("/") {
        error!("failed to chdir to /: {}", err);
        return ExitCode::FAILURE;
    }

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut daemon = match Daemon::start(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("startup failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let status = daemon.run();
    if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
