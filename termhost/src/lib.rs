#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! termhost library: pseudo-terminal sessions without a GUI.
//!
//! - `shell`: pty allocation (`shell::pty`) and child processes (`shell::process`)
//! - `broker`: permission handoff to the `termhost_grantpty` helper
//! - `sessions`: `TerminalSession` state machine and the `SessionRegistry`
//! - `emulation`: the collaborator that consumes pty output
//! - `config`: configuration loading
//! - `error`: `SessionError`

pub mod broker;
pub mod config;
pub mod emulation;
pub mod error;
pub mod sessions;
pub mod shell;
pub mod util;

// Re-export key types at crate root for convenience.
pub use broker::{HelperBroker, NoBroker, PermissionBroker};
pub use config::Config;
pub use emulation::{Emulation, EmulationEvent, NullEmulation, TitleTracker};
pub use error::SessionError;
pub use sessions::session::{
    SessionEvent, SessionId, SessionOptions, SessionState, TerminalSession,
};
pub use sessions::SessionRegistry;
pub use shell::process::ExitStatus;
