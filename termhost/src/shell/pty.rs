//! Pseudo-terminal allocation, line settings and window size.
//!
//! Uses the `nix` crate for the POSIX pty APIs. [`PtyDevice`] owns the master
//! descriptor for the lifetime of a session; the slave is handed out exactly
//! once, to the child process runner.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster, Winsize};
use nix::sys::termios::{self, InputFlags, SetArg, SpecialCharacterIndices};
use tracing::debug;

use crate::error::SessionError;

/// Terminal line discipline options applied to the slave before the child
/// starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    /// Honour XON/XOFF (Ctrl-S / Ctrl-Q) flow control.
    pub xon_xoff: bool,
    /// Tell the line discipline that input is UTF-8, so erase removes whole
    /// characters.
    pub utf8: bool,
    /// Erase character, if it should differ from the system default.
    pub erase: Option<u8>,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            xon_xoff: false,
            utf8: true,
            erase: None,
        }
    }
}

/// An open master and the name of its slave.
#[derive(Debug)]
pub struct PtyHandle {
    master: OwnedFd,
    slave_path: PathBuf,
}

impl PtyHandle {
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }
}

/// Allocator and owner of one master/slave pair.
///
/// A device can be opened once. The slave cannot be opened until the master
/// has been allocated, and only one slave is ever handed out per master.
#[derive(Debug, Default)]
pub struct PtyDevice {
    handle: Option<PtyHandle>,
    slave_opened: bool,
}

impl PtyDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new master and record its slave name.
    ///
    /// The master is non-blocking and close-on-exec, so it is never leaked
    /// into child processes by accident.
    pub fn open_pty(&mut self) -> Result<&PtyHandle, SessionError> {
        if self.handle.is_some() {
            return Err(SessionError::DeviceUnavailable(
                "pty master is already open".into(),
            ));
        }

        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(|e| SessionError::DeviceUnavailable(format!("posix_openpt: {e}")))?;
        grantpt(&master)
            .map_err(|e| SessionError::DeviceUnavailable(format!("grantpt: {e}")))?;
        unlockpt(&master)
            .map_err(|e| SessionError::DeviceUnavailable(format!("unlockpt: {e}")))?;
        let slave_path = slave_name(&master)?;

        // SAFETY: into_raw_fd transfers ownership of a valid descriptor.
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        set_fd_flags(&master)?;

        debug!("Allocated pty {}", slave_path.display());
        self.slave_opened = false;
        Ok(self.handle.insert(PtyHandle { master, slave_path }))
    }

    /// Open the slave side for a child process.
    ///
    /// Fails with [`SessionError::DeviceUnavailable`] if the master has not
    /// been allocated, or if the slave was already handed out.
    pub fn open_slave(&mut self) -> Result<OwnedFd, SessionError> {
        let handle = self.handle.as_ref().ok_or_else(|| {
            SessionError::DeviceUnavailable("slave requested before master was opened".into())
        })?;
        if self.slave_opened {
            return Err(SessionError::DeviceUnavailable(format!(
                "slave {} is already open",
                handle.slave_path.display()
            )));
        }
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&handle.slave_path)
            .map_err(|e| {
                SessionError::DeviceUnavailable(format!(
                    "cannot open {}: {e}",
                    handle.slave_path.display()
                ))
            })?;
        self.slave_opened = true;
        Ok(OwnedFd::from(slave))
    }

    /// Platform path of the slave, as reported by the OS allocator.
    pub fn device_name(&self) -> Option<&Path> {
        self.handle.as_ref().map(PtyHandle::slave_path)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&PtyHandle> {
        self.handle.as_ref()
    }

    /// Borrow the master descriptor, if open.
    pub fn master(&self) -> Option<BorrowedFd<'_>> {
        self.handle.as_ref().map(PtyHandle::master)
    }

    /// Duplicate the master for an I/O driver that needs its own owned handle.
    pub fn clone_master(&self) -> Result<File, SessionError> {
        let master = self.master().ok_or(SessionError::NotRunning)?;
        Ok(File::from(master.try_clone_to_owned()?))
    }

    /// Propagate terminal geometry to the child through the master.
    pub fn set_window_size(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let master = self.master().ok_or(SessionError::NotRunning)?;
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
        let ret = unsafe {
            libc::ioctl(
                master.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(winsize),
            )
        };
        if ret == -1 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }

    /// Apply flow control, UTF-8 mode and the erase character to `slave`.
    pub fn configure_line(
        &self,
        slave: BorrowedFd<'_>,
        settings: &LineSettings,
    ) -> Result<(), SessionError> {
        let mut tios = termios::tcgetattr(slave)?;
        tios.input_flags
            .set(InputFlags::IXON | InputFlags::IXOFF, settings.xon_xoff);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
        tios.input_flags.set(InputFlags::IUTF8, settings.utf8);
        if let Some(erase) = settings.erase {
            tios.control_chars[SpecialCharacterIndices::VERASE as usize] = erase;
        }
        termios::tcsetattr(slave, SetArg::TCSANOW, &tios)?;
        Ok(())
    }

    /// Allow or forbid other users' `write(1)` messages on the slave by
    /// toggling its group write bit.
    pub fn set_writeable(&self, writeable: bool) -> Result<(), SessionError> {
        let path = self.device_name().ok_or(SessionError::NotRunning)?;
        let mode = std::fs::metadata(path)?.permissions().mode() & 0o7777;
        let mode = if writeable {
            mode | 0o020
        } else {
            mode & !0o022
        };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Release the master. Idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Closed pty {}", handle.slave_path.display());
        }
    }
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> Result<PathBuf, SessionError> {
    nix::pty::ptsname_r(master)
        .map(PathBuf::from)
        .map_err(|e| SessionError::DeviceUnavailable(format!("ptsname: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> Result<PathBuf, SessionError> {
    // SAFETY: sessions are single-owner and the result is copied immediately.
    unsafe { nix::pty::ptsname(master) }
        .map(PathBuf::from)
        .map_err(|e| SessionError::DeviceUnavailable(format!("ptsname: {e}")))
}

fn set_fd_flags(fd: &OwnedFd) -> Result<(), SessionError> {
    let raw = fd.as_raw_fd();
    // SAFETY: plain flag manipulation on a descriptor we own.
    unsafe {
        let fl = libc::fcntl(raw, libc::F_GETFL);
        if fl == -1 || libc::fcntl(raw, libc::F_SETFL, fl | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error().into());
        }
        let fd_flags = libc::fcntl(raw, libc::F_GETFD);
        if fd_flags == -1 || libc::fcntl(raw, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}
