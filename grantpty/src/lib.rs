#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! termhost_grantpty: privileged pty permission helper.
//!
//! The unprivileged terminal process opens a pty master and runs this helper
//! with the master inherited at descriptor [`PTY_FILENO`]. The helper asks the
//! kernel which slave belongs to that master and changes the slave's
//! ownership and mode. Passing a descriptor instead of a path means a caller
//! cannot point the helper at an arbitrary file: only a master it actually
//! holds open can be named.
//!
//! This crate is both the helper binary and the contract shared with its
//! caller (descriptor slot, mode flags, exit codes).
//!
//! ```text
//! cli.rs     argument parsing (exactly one of --grant / --revoke)
//! error.rs   BrokerError and the exit-code contract
//! resolve.rs slave name validation and the /dev inode scan
//! system.rs  System trait and the real host implementation
//! grant.rs   execute(): privilege check, resolution, chown + chmod
//! ```

use std::os::fd::RawFd;

pub mod cli;
pub mod error;
pub mod grant;
pub mod resolve;
pub mod system;

pub use cli::{Cli, Mode};
pub use error::{BrokerError, EXIT_OK};
pub use grant::{execute, Ownership};
pub use system::{HostSystem, System};

/// Descriptor slot on which the helper expects the pty master.
///
/// Both the caller and the helper must agree on this number.
pub const PTY_FILENO: RawFd = 3;
