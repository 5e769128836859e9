//! Mapping from what the kernel reports about a master descriptor to the
//! slave device node whose permissions will be changed.
//!
//! Only two shapes are accepted:
//!
//! - Unix98 ptys, where `ptsname(3)` names the slave directly
//!   (`/dev/pts/<n>`).
//! - Legacy BSD ptys, where the master itself is `/dev/pty<xy>` and the slave
//!   is the matching `/dev/tty<xy>`.
//!
//! Anything else is refused before any filesystem mutation takes place.

use std::ffi::OsStr;
use std::os::unix::fs::{DirEntryExt, MetadataExt};
use std::path::{Component, Path, PathBuf};

use crate::error::BrokerError;

/// Directory holding Unix98 slave nodes.
pub const UNIX98_SLAVE_DIR: &str = "/dev/pts";
/// Directory scanned by the inode fallback.
pub const DEVICE_DIR: &str = "/dev";

const LEGACY_MASTER_STEM: &str = "pty";
const LEGACY_SLAVE_STEM: &str = "tty";

/// Accept a `ptsname(3)` result if it names a node directly inside
/// [`UNIX98_SLAVE_DIR`].
pub fn unix98_slave(name: &Path) -> Result<PathBuf, BrokerError> {
    let rest = name
        .strip_prefix(UNIX98_SLAVE_DIR)
        .map_err(|_| strange_name(name))?;
    match single_component(rest) {
        Some(_) => Ok(name.to_path_buf()),
        None => Err(strange_name(name)),
    }
}

/// Map a legacy master name (`/dev/ptyXY`) to its slave (`/dev/ttyXY`).
pub fn legacy_slave(master: &Path) -> Result<PathBuf, BrokerError> {
    let rest = master
        .strip_prefix(DEVICE_DIR)
        .map_err(|_| strange_name(master))?;
    let leaf = single_component(rest)
        .and_then(OsStr::to_str)
        .ok_or_else(|| strange_name(master))?;
    match leaf.strip_prefix(LEGACY_MASTER_STEM) {
        Some(suffix) if !suffix.is_empty() => {
            Ok(Path::new(DEVICE_DIR).join(format!("{LEGACY_SLAVE_STEM}{suffix}")))
        }
        _ => Err(strange_name(master)),
    }
}

/// Look through `dir` for an entry whose inode and device match the given
/// descriptor identity.
///
/// Used where `ttyname(3)` cannot name a master opened on a legacy device.
pub fn find_by_inode(dir: &Path, dev: u64, ino: u64) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.ino() == ino)
        .find(|entry| {
            std::fs::symlink_metadata(entry.path()).is_ok_and(|m| m.dev() == dev && m.ino() == ino)
        })
        .map(|entry| entry.path())
}

fn single_component(rest: &Path) -> Option<&OsStr> {
    let mut components = rest.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(leaf)), None) => Some(leaf),
        _ => None,
    }
}

fn strange_name(name: &Path) -> BrokerError {
    BrokerError::DeviceResolutionFailed(format!(
        "determined a strange device name `{}'",
        name.display()
    ))
}
