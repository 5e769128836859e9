//! Command-line surface of the helper.
//!
//! The helper accepts exactly one of `--grant` or `--revoke` and nothing
//! else. In particular it has no way to receive a device path: the device is
//! always derived from the descriptor inherited at [`crate::PTY_FILENO`].

use clap::{ArgGroup, Parser};

use crate::error::BrokerError;

/// Whether the slave is being attributed to the caller or released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Grant,
    Revoke,
}

impl Mode {
    /// The flag that selects this mode on the helper's command line.
    pub fn flag(self) -> &'static str {
        match self {
            Self::Grant => "--grant",
            Self::Revoke => "--revoke",
        }
    }
}

/// Grant or revoke ownership of the pty slave behind descriptor 3.
///
/// Helper for termhost, not intended to be called from the command line.
/// It must be installed setuid root to function.
#[derive(Debug, Parser)]
#[command(name = "termhost_grantpty", version)]
#[command(group(ArgGroup::new("mode").required(true).multiple(false)))]
pub struct Cli {
    /// Attribute the slave to the invoking user.
    #[arg(long, group = "mode")]
    grant: bool,
    /// Return the slave to root ownership.
    #[arg(long, group = "mode")]
    revoke: bool,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.grant {
            Mode::Grant
        } else {
            Mode::Revoke
        }
    }

    /// Parse an argument vector (including the program name) into a mode.
    ///
    /// Help and version requests count as invalid arguments too: the helper
    /// only ever does one of its two jobs.
    pub fn parse_mode<I, T>(args: I) -> Result<Mode, BrokerError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args)
            .map(|cli| cli.mode())
            .map_err(|e| BrokerError::InvalidArguments(e.render().to_string()))
    }
}
