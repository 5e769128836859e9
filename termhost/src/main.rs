#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termhost
//!
//! Run a program on a pseudo-terminal and bridge it to this process's own
//! terminal.
//!
//! ## Subcommands
//!
//! - `termhost run [--config] [--term] [--rows] [--cols] [-- program args...]`:
//!   run one session, copy its output to stdout, forward stdin to it, and
//!   exit with the program's status
//! - `termhost shells`: list the shells detected on this system
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, raw mode, the session loop
//! config.rs        TOML + env-var configuration
//! broker.rs        PermissionBroker trait, helper client
//! emulation.rs     Emulation trait, TitleTracker (vte), NullEmulation
//! error.rs         SessionError
//! shell/
//!   mod.rs         shell detection
//!   pty.rs         PtyDevice: open, slave, line settings, window size
//!   process.rs     ChildProcessRunner: setsid/TIOCSCTTY start, killpg, reap
//! sessions/
//!   session.rs     TerminalSession state machine and byte bridge
//!   mod.rs         SessionRegistry (ids, limit, sweep, shutdown)
//! ```

use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use termhost::config::Config;
use termhost::sessions::session::{SessionEvent, SessionState};
use termhost::shell;
use termhost::util::spawn_reader;
use termhost::{SessionError, SessionRegistry, TitleTracker};

/// Pseudo-terminal session host.
#[derive(Parser)]
#[command(name = "termhost", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program on a new pty (default: the configured shell).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Value of TERM for the program.
        #[arg(long)]
        term: Option<String>,
        #[arg(long)]
        rows: Option<u16>,
        #[arg(long)]
        cols: Option<u16>,
        /// Program and arguments.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List shells available on this system, most preferred first.
    Shells,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] termhost::config::ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Shells => {
            for shell in shell::detect_shells() {
                println!("{shell}");
            }
            ExitCode::SUCCESS
        }
        Commands::Run {
            config,
            term,
            rows,
            cols,
            command,
        } => match run_session(config, term, rows, cols, command).await {
            Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            Err(e) => {
                eprintln!("termhost: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_session(
    config_path: Option<PathBuf>,
    term: Option<String>,
    rows: Option<u16>,
    cols: Option<u16>,
    command: Vec<String>,
) -> Result<i32, CliError> {
    let mut config = Config::load(config_path.as_deref())?;

    // Initialize tracing; stdout belongs to the session.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let host_size = host_window_size();
    if let Some((host_rows, host_cols)) = host_size {
        config.session.rows = host_rows;
        config.session.cols = host_cols;
    }
    if let Some(rows) = rows {
        config.session.rows = rows;
    }
    if let Some(cols) = cols {
        config.session.cols = cols;
    }
    config.validate()?;
    let term = term.unwrap_or_else(|| config.session.term.clone());

    let (program, args) = match command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => (
            config
                .session
                .default_shell
                .clone()
                .unwrap_or_else(shell::default_shell),
            Vec::new(),
        ),
    };

    let (mut registry, mut events) = SessionRegistry::from_config(&config)?;
    let id = registry.create_session(Box::new(TitleTracker::new(std::io::stdout())))?;
    let Some(session) = registry.get_mut(id) else {
        return Err(SessionError::NotRunning.into());
    };
    session.run(&program, &args, &term)?;
    info!("termhost v{} running {program}", env!("CARGO_PKG_VERSION"));

    let raw_mode = RawMode::enable();
    let mut input = spawn_reader(std::io::stdin(), 1024)?;
    let mut input_open = true;
    let mut sigwinch = signal(SignalKind::window_change())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    while session.state() == SessionState::Running {
        tokio::select! {
            result = session.process() => {
                result?;
            }
            data = input.recv(), if input_open => match data {
                Some(bytes) => session.send_bytes(&bytes)?,
                None => {
                    debug!("stdin closed");
                    input_open = false;
                }
            },
            _ = sigwinch.recv(), if host_size.is_some() => {
                if let Some((rows, cols)) = host_window_size() {
                    session.resize(rows, cols)?;
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                session.terminate().await?;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP");
                session.terminate().await?;
            }
            Some(event) = events.recv() => match event {
                SessionEvent::TitleChanged(_) => debug!("Title: {}", session.display_title()),
                SessionEvent::ResizeRequested { rows, cols, .. } => {
                    if let Err(e) = session.resize(rows, cols) {
                        warn!("Resize to {rows}x{cols} refused: {e}");
                    }
                }
                SessionEvent::Bell(_)
                | SessionEvent::Activity(_)
                | SessionEvent::Silence(_)
                | SessionEvent::Finished { .. } => {}
            },
        }
    }
    drop(raw_mode);

    let status = session.exit_status();
    registry.sweep();
    match status {
        Some(status) => {
            info!("{program} {status}");
            Ok(status.code())
        }
        None => Ok(1),
    }
}

/// Size of the terminal on stdout, if there is one.
fn host_window_size() -> Option<(u16, u16)> {
    let stdout = std::io::stdout();
    if !stdout.is_terminal() {
        return None;
    }
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes into the provided struct.
    let ret = unsafe {
        libc::ioctl(
            stdout.as_fd().as_raw_fd(),
            libc::TIOCGWINSZ,
            std::ptr::addr_of_mut!(ws),
        )
    };
    (ret == 0 && ws.ws_row > 0 && ws.ws_col > 0).then_some((ws.ws_row, ws.ws_col))
}

/// Puts the controlling terminal on stdin into raw mode until dropped, so
/// keystrokes reach the session unprocessed.
struct RawMode {
    saved: Termios,
}

impl RawMode {
    fn enable() -> Option<Self> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return None;
        }
        let saved = termios::tcgetattr(stdin.as_fd()).ok()?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw) {
            warn!("Cannot switch terminal to raw mode: {e}");
            return None;
        }
        Some(Self { saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSADRAIN, &self.saved) {
            warn!("Cannot restore terminal mode: {e}");
        }
    }
}
