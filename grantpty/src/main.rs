#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! Entry point of the setuid helper.
//!
//! Logging goes to stderr at a fixed level. `RUST_LOG` is ignored: the
//! environment belongs to the unprivileged caller.

use std::os::fd::BorrowedFd;
use std::process::ExitCode;

use grantpty::{execute, BrokerError, Cli, HostSystem, PTY_FILENO};
use tracing::{error, Level};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::WARN)
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .init();

    let result = Cli::parse_mode(std::env::args_os()).and_then(|mode| {
        // SAFETY: F_GETFD only queries descriptor flags.
        if unsafe { libc::fcntl(PTY_FILENO, libc::F_GETFD) } == -1 {
            return Err(BrokerError::DeviceResolutionFailed(format!(
                "no descriptor inherited at slot {PTY_FILENO}"
            )));
        }
        // SAFETY: the slot was just checked to be open, and nothing in this
        // single-threaded process closes it while `execute` runs.
        let master = unsafe { BorrowedFd::borrow_raw(PTY_FILENO) };
        execute(mode, master, &HostSystem)
    });

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            if let BrokerError::InvalidArguments(usage) = &e {
                eprintln!("{usage}");
            } else {
                error!("{e}");
            }
            #[allow(clippy::cast_sign_loss)]
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
