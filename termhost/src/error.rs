//! Error taxonomy for the session core.

use std::io;
use std::path::PathBuf;

use grantpty::BrokerError;

/// Everything that can go wrong while starting, driving or stopping a
/// session.
///
/// Broker and exec failures abort startup; the state-machine variants are
/// local misuse reported synchronously to the caller. Nothing here is retried
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The OS has no free pty, or the device is not in a state to hand one out.
    #[error("no pseudo-terminal available: {0}")]
    DeviceUnavailable(String),
    /// The permission helper refused the grant.
    #[error("cannot start session: {0}")]
    Broker(#[from] BrokerError),
    /// The permission helper could not be launched at all.
    #[error("cannot start session: permission helper {} could not be run: {reason}", program.display())]
    BrokerUnavailable { program: PathBuf, reason: String },
    /// The child program could not be located or executed.
    #[error("cannot execute {program}: {source}")]
    ExecFailed {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session is not running")]
    NotRunning,
    #[error("session has already terminated")]
    AlreadyTerminated,
    #[error("session limit reached (max {0})")]
    SessionLimit(usize),
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
    #[error("pty I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether this error means the session never got a running child.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_)
                | Self::Broker(_)
                | Self::BrokerUnavailable { .. }
                | Self::ExecFailed { .. }
        )
    }
}

impl From<nix::errno::Errno> for SessionError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(io::Error::from(errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_failure_reads_as_cannot_start() {
        let err = SessionError::from(BrokerError::NotPrivileged);
        assert!(err.to_string().starts_with("cannot start session"));
        assert!(err.is_startup_failure());
    }

    #[test]
    fn test_state_errors_are_not_startup_failures() {
        assert!(!SessionError::AlreadyRunning.is_startup_failure());
        assert!(!SessionError::NotRunning.is_startup_failure());
        assert!(!SessionError::AlreadyTerminated.is_startup_failure());
    }

    #[test]
    fn test_errno_becomes_io() {
        let err = SessionError::from(nix::errno::Errno::EBADF);
        assert!(matches!(err, SessionError::Io(e) if e.raw_os_error() == Some(libc::EBADF)));
    }
}
