//! Client side of the pty permission handoff.
//!
//! The session never changes device permissions itself. It asks a
//! [`PermissionBroker`] to grant the slave behind an open master when a
//! session starts and to revoke it when the session ends. The real broker is
//! the `termhost_grantpty` helper, which receives the master on
//! [`PTY_FILENO`] and reports back through its exit status.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use grantpty::{BrokerError, Mode, PTY_FILENO};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::SessionError;

/// Changes ownership of the slave behind a master descriptor.
///
/// Implementations only ever see the descriptor, never a path.
pub trait PermissionBroker: Send + Sync {
    fn grant(&self, master: BorrowedFd<'_>) -> Result<(), SessionError>;
    fn revoke(&self, master: BorrowedFd<'_>) -> Result<(), SessionError>;
}

/// Build the broker selected by `config`.
///
/// Without a helper path the platform's `grantpt` is trusted to have
/// attributed the slave already.
pub fn from_config(config: &BrokerConfig) -> Arc<dyn PermissionBroker> {
    match &config.program {
        Some(program) => Arc::new(HelperBroker::new(program)),
        None => Arc::new(NoBroker),
    }
}

/// Runs the privileged helper once per request.
#[derive(Debug, Clone)]
pub struct HelperBroker {
    program: PathBuf,
}

impl HelperBroker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the helper with `master` on [`PTY_FILENO`] and wait for it.
    fn run(&self, mode: Mode, master: BorrowedFd<'_>) -> Result<(), SessionError> {
        let master_fd = master.as_raw_fd();
        let mut cmd = Command::new(&self.program);
        cmd.arg(mode.flag())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // SAFETY: dup2 and fcntl are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(move || {
                if master_fd == PTY_FILENO {
                    let flags = libc::fcntl(master_fd, libc::F_GETFD);
                    if flags == -1
                        || libc::fcntl(master_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(master_fd, PTY_FILENO) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let output = cmd.output().map_err(|e| SessionError::BrokerUnavailable {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        let diagnostic = String::from_utf8_lossy(&output.stderr);

        let Some(code) = output.status.code() else {
            return Err(SessionError::BrokerUnavailable {
                program: self.program.clone(),
                reason: format!("helper terminated abnormally ({})", output.status),
            });
        };
        match BrokerError::from_exit_code(code, &diagnostic) {
            None => {
                debug!("{} {} succeeded", self.program.display(), mode.flag());
                Ok(())
            }
            Some(err) => {
                warn!("{} {} failed: {err}", self.program.display(), mode.flag());
                Err(err.into())
            }
        }
    }
}

impl PermissionBroker for HelperBroker {
    fn grant(&self, master: BorrowedFd<'_>) -> Result<(), SessionError> {
        self.run(Mode::Grant, master)
    }

    fn revoke(&self, master: BorrowedFd<'_>) -> Result<(), SessionError> {
        self.run(Mode::Revoke, master)
    }
}

/// Accepts every request without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBroker;

impl PermissionBroker for NoBroker {
    fn grant(&self, _master: BorrowedFd<'_>) -> Result<(), SessionError> {
        Ok(())
    }

    fn revoke(&self, _master: BorrowedFd<'_>) -> Result<(), SessionError> {
        Ok(())
    }
}
