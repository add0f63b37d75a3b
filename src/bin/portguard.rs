//! `portguard`: the command-line client for `bookkeeperd`.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgEnum, Parser};

use bookkeeper::accounts;
use bookkeeper::config::DEFAULT_SOCKPATH;
use bookkeeper::control::protocol::{self, Opcode};

#[derive(Copy, Clone, Debug, ArgEnum)]
#[clap(rename_all = "snake_case")]
enum Command {
    Reserve,
    Release,
    List,
    NoReacquire,
    Reacquire,
}

/// Release, reserve, or inspect a user's reserved port.
#[derive(Parser, Debug)]
#[clap(name = "portguard")]
struct Args {
    /// Path of the daemon's control socket.
    #[clap(long = "sockpath", default_value = DEFAULT_SOCKPATH)]
    sockpath: PathBuf,

    /// Act on this user instead of the caller. Honored only when the
    /// caller is root.
    #[clap(long = "user")]
    user: Option<String>,

    /// Defaults to `list` when omitted.
    #[clap(arg_enum)]
    command: Option<Command>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::List);

    let caller_uid = unsafe { libc::getuid() };
    let target_uid = match resolve_target_uid(args.user.as_deref(), caller_uid) {
        Ok(uid) => uid,
        Err(message) => {
            eprintln!("portguard: {}", message);
            return ExitCode::FAILURE;
        }
    };

    let request = protocol::Request {
        opcode_raw: opcode_for(command).to_raw(),
        uid: target_uid,
        port: 0,
        suppress_reacquire: match command {
            Command::NoReacquire => 1,
            _ => 0,
        },
    };

    let mut stream = match UnixStream::connect(&args.sockpath) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("portguard: cannot connect to {}: {}", args.sockpath.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let (header, entries) = match protocol::roundtrip(&mut stream, &request) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("portguard: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if header.error != 0 {
        eprintln!(
            "portguard: request failed: {}",
            std::io::Error::from_raw_os_error(header.error as i32)
        );
        return ExitCode::FAILURE;
    }

    if matches!(command, Command::List) {
        print_listing(&entries);
    }

    ExitCode::SUCCESS
}

fn resolve_target_uid(user: Option<&str>, caller_uid: u32) -> Result<u32, String> {
    match user {
        Some(name) if caller_uid == 0 => accounts::resolve_user(name)
            .map(|(uid, _gid)| uid)
            .ok_or_else(|| format!("user {:?} does not exist", name)),
        Some(_) => Ok(caller_uid),
        None => Ok(caller_uid),
    }
}

fn opcode_for(command: Command) -> Opcode {
    match command {
        Command::Reserve => Opcode::Reserve,
        Command::Release => Opcode::Release,
        Command::List => Opcode::List,
        Command::NoReacquire | Command::Reacquire => Opcode::Policy,
    }
}

fn print_listing(entries: &[protocol::PortEntry]) {
    println!("{:<24}{:<8}{:<16}{:<8}", "User", "Port", "Status", "Re-acquire");
    println!("{}", "-".repeat(60));
    for entry in entries {
        let user = accounts::by_uid(entry.uid)
            .map(|account| account.name)
            .unwrap_or_else(|| entry.uid.to_string());
        let status = match entry.status {
            protocol::STATUS_RESERVED => "reserved",
            protocol::STATUS_RELEASED => "released",
            protocol::STATUS_UNKNOWN => "",
            _ => "unknown",
        };
        let reacquire = match entry.suppress_reacquire {
            protocol::REACQUIRE_DO => "yes",
            protocol::REACQUIRE_DONT => "no",
            protocol::REACQUIRE_UNKNOWN => "",
            _ => "unknown",
        };
        println!("{:<24}{:<8}{:<16}{:<8}", user, entry.port, status, reacquire);
    }
}
