//! The grant/revoke operation itself.

use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::cli::Mode;
use crate::error::BrokerError;
use crate::system::System;

/// Mode of a granted slave: owner read/write, group write (`mesg y`).
pub const GRANTED_MODE: u32 = 0o620;

/// Mode of a revoked slave.
///
/// World read/write, carried over from the historical helper so that a later
/// session can always re-grant the node. See DESIGN.md for the open question
/// around this.
pub const REVOKED_MODE: u32 = 0o666;

/// Owner of a revoked slave.
pub const ROOT_UID: u32 = 0;

/// Ownership and mode applied to a slave node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Ownership {
    /// What `mode` should leave behind, given the invoking user and tty group.
    pub fn for_mode(mode: Mode, caller_uid: u32, tty_gid: u32) -> Self {
        match mode {
            Mode::Grant => Self {
                uid: caller_uid,
                gid: tty_gid,
                mode: GRANTED_MODE,
            },
            Mode::Revoke => Self::neutral(tty_gid),
        }
    }

    /// The state of a slave that is not attributed to any user.
    pub fn neutral(tty_gid: u32) -> Self {
        Self {
            uid: ROOT_UID,
            gid: tty_gid,
            mode: REVOKED_MODE,
        }
    }
}

/// Grant or revoke the slave behind `master`.
///
/// The device is identified only through the open descriptor: there is no
/// way to hand this function a path. On success the slave path that was
/// changed is returned. On failure nothing has been mutated: if `chmod`
/// fails after `chown`, the previous owner is put back.
pub fn execute(
    mode: Mode,
    master: BorrowedFd<'_>,
    sys: &impl System,
) -> Result<PathBuf, BrokerError> {
    if sys.effective_uid() != ROOT_UID {
        return Err(BrokerError::NotPrivileged);
    }

    let slave = sys.slave_path(master)?;
    if !sys.is_char_device(&slave) {
        return Err(BrokerError::NotACharacterDevice(slave));
    }

    let target = Ownership::for_mode(mode, sys.real_uid(), sys.tty_gid());
    let (prior_uid, prior_gid) = sys
        .owner(&slave)
        .map_err(|e| BrokerError::PermissionChangeFailed {
            path: slave.clone(),
            reason: format!("stat: {e}"),
        })?;
    sys.chown(&slave, target.uid, target.gid)
        .map_err(|e| BrokerError::PermissionChangeFailed {
            path: slave.clone(),
            reason: format!("chown: {e}"),
        })?;
    if let Err(e) = sys.chmod(&slave, target.mode) {
        if let Err(undo) = sys.chown(&slave, prior_uid, prior_gid) {
            warn!(
                "{} left owned by {}:{}: {undo}",
                slave.display(),
                target.uid,
                target.gid
            );
        }
        return Err(BrokerError::PermissionChangeFailed {
            path: slave,
            reason: format!("chmod: {e}"),
        });
    }

    info!(
        "{} {} (uid {} gid {} mode {:o})",
        mode.flag(),
        slave.display(),
        target.uid,
        target.gid,
        target.mode
    );
    Ok(slave)
}
