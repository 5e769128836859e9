//! Failure taxonomy of the helper and its exit-code contract.
//!
//! The helper communicates with its unprivileged caller through the process
//! exit status alone, plus a diagnostic line on stderr. Each failure kind has
//! its own status so the caller can reconstruct the error without parsing
//! text.

use std::path::PathBuf;

/// Exit status reported on success.
pub const EXIT_OK: i32 = 0;

/// Why a grant or revoke attempt was refused.
///
/// Every variant is fatal to the attempt and is never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Anything other than exactly one `--grant` or `--revoke` flag.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The helper is not running with an effective uid of root.
    #[error("not installed root-suid")]
    NotPrivileged,
    /// The inherited descriptor does not lead to a recognisable pty slave.
    #[error("cannot determine the name of device: {0}")]
    DeviceResolutionFailed(String),
    /// The resolved slave path exists but is not a character device.
    #[error("found `{}' not to be a character device", .0.display())]
    NotACharacterDevice(PathBuf),
    /// `chown` or `chmod` on the slave failed.
    #[error("cannot change permissions of {}: {reason}", path.display())]
    PermissionChangeFailed { path: PathBuf, reason: String },
}

impl BrokerError {
    /// Distinguished non-zero exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArguments(_) => 1,
            Self::NotPrivileged => 2,
            Self::DeviceResolutionFailed(_) => 3,
            Self::NotACharacterDevice(_) => 4,
            Self::PermissionChangeFailed { .. } => 5,
        }
    }

    /// Rebuild an error on the caller side from the helper's exit status and
    /// the diagnostic it printed.
    ///
    /// Returns `None` for [`EXIT_OK`]. Unknown statuses are treated as
    /// resolution failures, since the caller cannot tell what was attempted.
    pub fn from_exit_code(code: i32, diagnostic: &str) -> Option<Self> {
        let diagnostic = diagnostic.trim().to_string();
        match code {
            EXIT_OK => None,
            1 => Some(Self::InvalidArguments(diagnostic)),
            2 => Some(Self::NotPrivileged),
            4 => Some(Self::NotACharacterDevice(PathBuf::from(
                quoted_path(&diagnostic).unwrap_or(&diagnostic),
            ))),
            5 => Some(Self::PermissionChangeFailed {
                path: PathBuf::new(),
                reason: diagnostic,
            }),
            other => Some(Self::DeviceResolutionFailed(format!(
                "helper exited with status {other}: {diagnostic}"
            ))),
        }
    }
}

/// Extract the path between the quotes of a `NotACharacterDevice` message.
fn quoted_path(diagnostic: &str) -> Option<&str> {
    let start = diagnostic.find('`')? + 1;
    let len = diagnostic[start..].find('\'')?;
    Some(&diagnostic[start..start + len])
}
