//! Host effects the helper depends on.
//!
//! [`HostSystem`] talks to the real kernel. Tests substitute their own
//! [`System`] so the validation logic can be exercised without root.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{chown, geteuid, getgid, getuid, Gid, Group, Uid};
use tracing::debug;

use crate::error::BrokerError;
use crate::resolve;

/// Name of the group that owns terminal devices.
pub const TTY_GROUP: &str = "tty";

/// Everything the helper needs from the operating system.
pub trait System {
    /// Effective uid of the helper process.
    fn effective_uid(&self) -> u32;
    /// Real uid, i.e. the unprivileged user who invoked the helper.
    fn real_uid(&self) -> u32;
    /// Gid of [`TTY_GROUP`], or the real gid if the group does not exist.
    fn tty_gid(&self) -> u32;
    /// Slave device node for the master open on `master`.
    fn slave_path(&self, master: BorrowedFd<'_>) -> Result<PathBuf, BrokerError>;
    fn is_char_device(&self, path: &Path) -> bool;
    /// Current `(uid, gid)` of `path`.
    fn owner(&self, path: &Path) -> io::Result<(u32, u32)>;
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;
}

/// The real operating system.
pub struct HostSystem;

impl System for HostSystem {
    fn effective_uid(&self) -> u32 {
        geteuid().as_raw()
    }

    fn real_uid(&self) -> u32 {
        getuid().as_raw()
    }

    fn tty_gid(&self) -> u32 {
        match Group::from_name(TTY_GROUP) {
            Ok(Some(group)) => group.gid.as_raw(),
            _ => getgid().as_raw(),
        }
    }

    fn slave_path(&self, master: BorrowedFd<'_>) -> Result<PathBuf, BrokerError> {
        if let Some(name) = ptsname(master) {
            debug!("ptsname reported {}", name.display());
            return resolve::unix98_slave(&name);
        }
        if let Some(name) = ttyname(master) {
            debug!("ttyname reported {}", name.display());
            return resolve::legacy_slave(&name);
        }
        let meta = master
            .try_clone_to_owned()
            .map(std::fs::File::from)
            .and_then(|file| file.metadata())
            .map_err(|e| {
                BrokerError::DeviceResolutionFailed(format!("descriptor is not usable: {e}"))
            })?;
        let name = resolve::find_by_inode(Path::new(resolve::DEVICE_DIR), meta.dev(), meta.ino())
            .ok_or_else(|| {
                BrokerError::DeviceResolutionFailed("no device node matches descriptor".into())
            })?;
        debug!("inode scan found {}", name.display());
        resolve::legacy_slave(&name)
    }

    fn is_char_device(&self, path: &Path) -> bool {
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_char_device())
    }

    fn owner(&self, path: &Path) -> io::Result<(u32, u32)> {
        let meta = std::fs::metadata(path)?;
        Ok((meta.uid(), meta.gid()))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(io::Error::from)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
}

fn ptsname(master: BorrowedFd<'_>) -> Option<PathBuf> {
    // SAFETY: the helper is single-threaded, so the static buffer returned by
    // ptsname(3) cannot be overwritten before it is copied.
    let ptr = unsafe { libc::ptsname(master.as_raw_fd()) };
    cstr_path(ptr)
}

fn ttyname(master: BorrowedFd<'_>) -> Option<PathBuf> {
    // SAFETY: as for ptsname above.
    let ptr = unsafe { libc::ttyname(master.as_raw_fd()) };
    cstr_path(ptr)
}

fn cstr_path(ptr: *const libc::c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null pointers from ptsname/ttyname are NUL-terminated.
    let name = unsafe { CStr::from_ptr(ptr) };
    Some(PathBuf::from(name.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::pty::{grantpt, posix_openpt, unlockpt};

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_resolves_unix98_slave_from_master() {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let expected = nix::pty::ptsname_r(&master).unwrap();

        // SAFETY: `master` outlives the borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(master.as_raw_fd()) };
        let path = HostSystem.slave_path(fd).unwrap();
        assert_eq!(path, PathBuf::from(expected));
        assert!(HostSystem.is_char_device(&path));
    }

    #[test]
    fn test_host_rejects_regular_file_descriptor() {
        let file = tempfile::tempfile().unwrap();
        // SAFETY: `file` outlives the borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(file.as_raw_fd()) };
        assert!(matches!(
            HostSystem.slave_path(fd),
            Err(BrokerError::DeviceResolutionFailed(_))
        ));
    }

    #[test]
    fn test_regular_file_is_not_char_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!HostSystem.is_char_device(file.path()));
        assert!(HostSystem.is_char_device(Path::new("/dev/null")));
    }

    #[test]
    fn test_owner_of_own_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (uid, _gid) = HostSystem.owner(file.path()).unwrap();
        assert_eq!(uid, getuid().as_raw());
        assert!(HostSystem.owner(Path::new("/nonexistent/node")).is_err());
    }
}
