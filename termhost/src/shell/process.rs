//! Child process startup on a pty slave, signalling and reaping.
//!
//! The child becomes a session leader with the slave as its controlling
//! terminal and as stdin/stdout/stderr. Exit is observed through tokio's
//! SIGCHLD-driven [`Child::wait`], so the session loop never blocks on
//! `waitpid`.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::SessionError;

/// What to run inside a session.
#[derive(Debug, Clone, Default)]
pub struct ChildSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Value for `TERM`. Left unset in the child when empty.
    pub term_type: String,
    /// Extra variables merged into the inherited environment.
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ChildSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, term_type: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            term_type: term_type.into(),
            ..Self::default()
        }
    }
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

impl ExitStatus {
    pub fn from_std(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            },
            // Stopped/continued statuses never reach a reaped child.
            (None, None) => Self::Exited(-1),
        }
    }

    /// Exit code in shell convention: the code itself, or 128 + signal.
    pub fn code(&self) -> i32 {
        match *self {
            Self::Exited(code) => code,
            Self::Signaled { signal, .. } => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled {
                signal,
                core_dumped,
            } => {
                let name = Signal::try_from(signal).map_or("unknown", Signal::as_str);
                write!(f, "killed by signal {signal} ({name})")?;
                if core_dumped {
                    write!(f, ", core dumped")?;
                }
                Ok(())
            }
        }
    }
}

/// A started child. Dropping it kills the child.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    child: Child,
    exit_status: Option<ExitStatus>,
}

impl ChildHandle {
    /// Process id, which is also the child's process group id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.exit_status.is_none()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Wait for the child to exit. Cancel safe, and returns the cached status
    /// on every call after the first completion.
    pub async fn wait(&mut self) -> Result<ExitStatus, SessionError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = ExitStatus::from_std(self.child.wait().await?);
        debug!("Child {} {status}", self.pid);
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Reap without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, SessionError> {
        if self.exit_status.is_none() {
            if let Some(status) = self.child.try_wait()? {
                self.exit_status = Some(ExitStatus::from_std(status));
            }
        }
        Ok(self.exit_status)
    }
}

/// Starts programs on a pty slave and delivers signals to them.
pub struct ChildProcessRunner;

impl ChildProcessRunner {
    /// Start `launch` with `slave` as its controlling terminal.
    ///
    /// Must be called from within a tokio runtime. The slave descriptor is
    /// consumed: the parent keeps no handle to it once the child is running.
    /// A program that cannot be found or executed is reported here as
    /// [`SessionError::ExecFailed`], before any I/O happens.
    pub fn start(slave: OwnedFd, launch: &ChildSpec) -> Result<ChildHandle, SessionError> {
        let slave_fd = slave.as_raw_fd();
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args).kill_on_drop(true);

        // stdio is wired to the slave in pre_exec.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&launch.env);
        if launch.term_type.is_empty() {
            cmd.env_remove("TERM");
        } else {
            cmd.env("TERM", &launch.term_type);
        }

        // SAFETY: All syscalls used here are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                for target in 0..=2 {
                    if libc::dup2(slave_fd, target) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SessionError::ExecFailed {
            program: launch.program.clone(),
            source,
        })?;
        drop(slave);

        let raw_pid = child.id().ok_or_else(|| SessionError::ExecFailed {
            program: launch.program.clone(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(raw_pid as i32);
        debug!("Started {} as pid {pid}", launch.program);

        Ok(ChildHandle {
            pid,
            child,
            exit_status: None,
        })
    }

    /// Deliver `signal` to the child's whole process group.
    pub fn signal(pid: Pid, signal: Signal) -> Result<(), SessionError> {
        killpg(pid, signal)?;
        Ok(())
    }
}
