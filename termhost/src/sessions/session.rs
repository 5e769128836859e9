//! One pseudo-terminal session: a pty, the program running on it, and the
//! byte bridge to an emulation.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --run()--> Running --child exits--> Terminated
//! ```
//!
//! `Terminated` is final. A failed [`TerminalSession::run`] leaves the session
//! `Idle` with its pty released, so the caller may try again.
//!
//! ## Driving a session
//!
//! The owner calls [`TerminalSession::process`] in a loop on a tokio runtime.
//! Each call waits for one of: output on the master, room to write queued
//! input, the silence deadline, or the child exiting. Child exit drains what
//! is left of the output, revokes and closes the pty, and only then emits
//! [`SessionEvent::Finished`], exactly once.
//!
//! ## Monitoring
//!
//! With activity monitoring on, the first output after a quiet spell of
//! `silence_timeout` raises [`SessionEvent::Activity`]. With silence
//! monitoring on, `silence_timeout` without output raises
//! [`SessionEvent::Silence`]. While the output is locked (scroll lock), the
//! master is not read at all and the child blocks once the pty buffer fills.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::PermissionBroker;
use crate::config::{ConfigError, SessionConfig};
use crate::emulation::{Emulation, EmulationEvent};
use crate::error::SessionError;
use crate::shell::process::{ChildHandle, ChildProcessRunner, ChildSpec, ExitStatus};
use crate::shell::pty::{LineSettings, PtyDevice};

/// Registry-assigned session number.
pub type SessionId = u64;

/// Bytes read from the master per dispatch step.
pub const READ_BLOCK: usize = 4096;

/// User title shown by a session that stays around after its program ended.
pub const FINISHED_TITLE: &str = "<Finished>";

/// How long teardown keeps collecting output after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Quiet time before a monitored session counts as silent.
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Terminated => "terminated",
        })
    }
}

/// Notifications from a session to whoever owns the receiving channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Title, user title, icon text or icon name changed.
    TitleChanged(SessionId),
    /// The program asked for a different window size.
    ResizeRequested {
        id: SessionId,
        rows: u16,
        cols: u16,
    },
    Bell(SessionId),
    /// Output resumed after a quiet spell. Needs activity monitoring.
    Activity(SessionId),
    /// No output for the silence timeout. Needs silence monitoring.
    Silence(SessionId),
    /// The program ended and the pty has been released.
    Finished { id: SessionId, status: ExitStatus },
}

/// Per-session settings, usually derived from [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub rows: u16,
    pub cols: u16,
    pub line: LineSettings,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Time between the graceful signal and SIGKILL in [`TerminalSession::terminate`].
    pub grace_period: Duration,
    pub terminate_signal: Signal,
    pub auto_close: bool,
    pub monitor_activity: bool,
    pub monitor_silence: bool,
    pub silence_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            line: LineSettings::default(),
            env: HashMap::new(),
            working_dir: None,
            grace_period: Duration::from_secs(3),
            terminate_signal: Signal::SIGHUP,
            auto_close: true,
            monitor_activity: false,
            monitor_silence: false,
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            rows: config.rows,
            cols: config.cols,
            line: config.line_settings(),
            env: config.env.clone(),
            working_dir: config.working_dir(),
            grace_period: config.grace_period(),
            terminate_signal: config.terminate_signal()?,
            auto_close: config.auto_close,
            monitor_activity: config.monitor_activity,
            monitor_silence: config.monitor_silence,
            silence_timeout: config.silence_timeout(),
        })
    }
}

/// State that only exists while a child is running.
struct Running {
    child: ChildHandle,
    io: AsyncFd<File>,
    /// Queued input for the child, oldest first.
    pending: VecDeque<Vec<u8>>,
    read_open: bool,
    /// Reading is suspended while set.
    locked: bool,
    silence_at: Option<Instant>,
}

enum Wake {
    Read(usize),
    Eof,
    Wrote,
    Silence,
    Exited(ExitStatus),
}

impl Running {
    /// Wait for the next thing that needs the session's attention.
    async fn next(&mut self, buf: &mut [u8]) -> Result<Wake, SessionError> {
        let Running {
            child,
            io,
            pending,
            read_open,
            locked,
            silence_at,
        } = self;
        loop {
            let deadline = *silence_at;
            tokio::select! {
                guard = io.readable(), if *read_open && !*locked => {
                    let mut guard = guard?;
                    match guard.try_io(|fd| read_master(fd.get_ref(), buf)) {
                        Ok(Ok(0)) => return Ok(Wake::Eof),
                        Ok(Ok(n)) => return Ok(Wake::Read(n)),
                        Ok(Err(e)) if is_hangup(&e) => return Ok(Wake::Eof),
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_would_block) => continue,
                    }
                }
                guard = io.writable(), if !pending.is_empty() => {
                    let mut guard = guard?;
                    let Some(front) = pending.front_mut() else {
                        continue;
                    };
                    match guard.try_io(|fd| write_master(fd.get_ref(), &front[..])) {
                        Ok(Ok(n)) => {
                            front.drain(..n);
                            if front.is_empty() {
                                pending.pop_front();
                            }
                            return Ok(Wake::Wrote);
                        }
                        Ok(Err(e)) if is_hangup(&e) => {
                            pending.clear();
                            return Ok(Wake::Wrote);
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_would_block) => continue,
                    }
                }
                () = wait_deadline(deadline), if deadline.is_some() => {
                    *silence_at = None;
                    return Ok(Wake::Silence);
                }
                status = child.wait() => return Ok(Wake::Exited(status?)),
            }
        }
    }

    /// Read whatever output is left after the child exited.
    async fn drain_once(&mut self, buf: &mut [u8], deadline: Instant) -> Option<usize> {
        loop {
            let Ok(Ok(mut guard)) = tokio::time::timeout_at(deadline, self.io.readable()).await
            else {
                return None;
            };
            match guard.try_io(|fd| read_master(fd.get_ref(), buf)) {
                Ok(Ok(n)) if n > 0 => return Some(n),
                Ok(_) => {
                    self.read_open = false;
                    return None;
                }
                Err(_would_block) => continue,
            }
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn read_master(master: &File, buf: &mut [u8]) -> io::Result<usize> {
    let mut reader = master;
    reader.read(buf)
}

fn write_master(master: &File, data: &[u8]) -> io::Result<usize> {
    let mut writer = master;
    writer.write(data)
}

/// Outcome of [`TerminalSession::step`].
enum Step {
    Output(usize),
    Exited(ExitStatus),
}

/// Linux reports a master whose slave side is fully closed with EIO.
fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

/// A terminal session.
pub struct TerminalSession {
    id: SessionId,
    state: SessionState,
    options: SessionOptions,
    pty: PtyDevice,
    running: Option<Running>,
    granted: bool,
    broker: Arc<dyn PermissionBroker>,
    emulation: Box<dyn Emulation>,
    events: mpsc::UnboundedSender<SessionEvent>,
    program: String,
    exit_status: Option<ExitStatus>,
    title: String,
    user_title: String,
    icon_text: String,
    icon_name: String,
    rows: u16,
    cols: u16,
    keymap_id: String,
    output_locked: bool,
    notified_activity: bool,
}

impl TerminalSession {
    pub fn new(
        id: SessionId,
        options: SessionOptions,
        broker: Arc<dyn PermissionBroker>,
        emulation: Box<dyn Emulation>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (rows, cols) = (options.rows, options.cols);
        Self {
            id,
            state: SessionState::Idle,
            options,
            pty: PtyDevice::new(),
            running: None,
            granted: false,
            broker,
            emulation,
            events,
            program: String::new(),
            exit_status: None,
            title: String::new(),
            user_title: String::new(),
            icon_text: String::new(),
            icon_name: String::new(),
            rows,
            cols,
            keymap_id: String::new(),
            output_locked: false,
            notified_activity: false,
        }
    }

    /// Start `program` on a fresh pty.
    ///
    /// Must be called from within a tokio runtime. The permission helper runs
    /// synchronously before the program starts.
    pub fn run(
        &mut self,
        program: &str,
        args: &[String],
        term_type: &str,
    ) -> Result<(), SessionError> {
        match self.state {
            SessionState::Running => return Err(SessionError::AlreadyRunning),
            SessionState::Terminated => return Err(SessionError::AlreadyTerminated),
            SessionState::Idle => {}
        }

        let launch = ChildSpec {
            program: program.to_string(),
            args: args.to_vec(),
            term_type: term_type.to_string(),
            env: self.options.env.clone(),
            working_dir: self.options.working_dir.clone(),
        };
        let running = match self.start(&launch) {
            Ok(running) => running,
            Err(e) => {
                warn!("Session {}: cannot start {program}: {e}", self.id);
                self.release();
                return Err(e);
            }
        };

        info!(
            "Session {} started {program} (pid {}) on {}",
            self.id,
            running.child.pid(),
            self.pty
                .device_name()
                .map_or_else(|| "?".into(), |p| p.display().to_string())
        );
        self.running = Some(running);
        self.state = SessionState::Running;
        self.program = program.to_string();
        if self.title.is_empty() {
            self.title = Path::new(program)
                .file_name()
                .map_or_else(|| program.to_string(), |n| n.to_string_lossy().into_owned());
        }
        if let Err(e) = self.pty.set_writeable(false) {
            warn!("Session {}: cannot restrict slave permissions: {e}", self.id);
        }
        Ok(())
    }

    fn start(&mut self, launch: &ChildSpec) -> Result<Running, SessionError> {
        let handle = self.pty.open_pty()?;
        self.broker.grant(handle.master())?;
        self.granted = true;

        self.pty.set_window_size(self.rows, self.cols)?;
        let slave = self.pty.open_slave()?;
        self.pty.configure_line(slave.as_fd(), &self.options.line)?;
        // SAFETY: the duplicate is owned by the `File`, which the `AsyncFd`
        // owns until it is dropped.
        let io = unsafe { AsyncFd::register(self.pty.clone_master()?) }
            .map_err(io::Error::from)?;
        let child = ChildProcessRunner::start(slave, launch)?;

        self.notified_activity = false;
        let silence_at = self
            .options
            .monitor_silence
            .then(|| Instant::now() + self.options.silence_timeout);
        Ok(Running {
            child,
            io,
            pending: VecDeque::new(),
            read_open: true,
            locked: self.output_locked,
            silence_at,
        })
    }

    /// Run one dispatch step. Returns the number of output bytes handed to
    /// the emulation.
    pub async fn process(&mut self) -> Result<usize, SessionError> {
        let mut buf = [0u8; READ_BLOCK];
        match self.step(&mut buf).await? {
            Step::Output(n) => Ok(n),
            Step::Exited(status) => {
                self.finish(status).await;
                Ok(0)
            }
        }
    }

    /// One dispatch step short of teardown.
    async fn step(&mut self, buf: &mut [u8]) -> Result<Step, SessionError> {
        let running = match self.state {
            SessionState::Idle => return Err(SessionError::NotRunning),
            SessionState::Terminated => return Err(SessionError::AlreadyTerminated),
            SessionState::Running => self.running.as_mut().ok_or(SessionError::NotRunning)?,
        };

        match running.next(buf).await? {
            Wake::Read(n) => {
                self.note_activity();
                self.feed(&buf[..n]);
                Ok(Step::Output(n))
            }
            Wake::Eof => {
                debug!("Session {}: output closed", self.id);
                running.read_open = false;
                Ok(Step::Output(0))
            }
            Wake::Wrote => Ok(Step::Output(0)),
            Wake::Silence => {
                self.silence_elapsed();
                Ok(Step::Output(0))
            }
            Wake::Exited(status) => Ok(Step::Exited(status)),
        }
    }

    /// Keep dispatching until the child has been reaped, without tearing
    /// the session down.
    async fn wait_exit(&mut self) -> Result<ExitStatus, SessionError> {
        let mut buf = [0u8; READ_BLOCK];
        loop {
            if let Step::Exited(status) = self.step(&mut buf).await? {
                return Ok(status);
            }
        }
    }

    /// Drive the session until its program has ended.
    pub async fn run_until_finished(&mut self) -> Result<(), SessionError> {
        while self.state == SessionState::Running {
            self.process().await?;
        }
        Ok(())
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.emulation.receive_block(bytes);
        self.apply_emulation_events();
    }

    fn apply_emulation_events(&mut self) {
        for event in self.emulation.take_events() {
            match event {
                EmulationEvent::Write(data) => {
                    if let Some(running) = self.running.as_mut() {
                        running.pending.push_back(data);
                    }
                }
                EmulationEvent::UserTitle { what, caption } => self.set_user_title(what, &caption),
                EmulationEvent::SizeRequest { rows, cols } => {
                    self.emit(SessionEvent::ResizeRequested {
                        id: self.id,
                        rows,
                        cols,
                    });
                }
                EmulationEvent::Bell => self.emit(SessionEvent::Bell(self.id)),
                EmulationEvent::LockPty(lock) => self.lock_output(lock),
            }
        }
    }

    async fn finish(&mut self, status: ExitStatus) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut buf = [0u8; READ_BLOCK];
        loop {
            let n = match self.running.as_mut() {
                Some(running) if running.read_open => running.drain_once(&mut buf, deadline).await,
                _ => None,
            };
            match n {
                Some(n) => self.feed(&buf[..n]),
                None => break,
            }
        }

        self.release();
        self.state = SessionState::Terminated;
        self.exit_status = Some(status);
        if !self.options.auto_close {
            self.user_title = FINISHED_TITLE.to_string();
            self.emit(SessionEvent::TitleChanged(self.id));
        }
        info!("Session {} {status}", self.id);
        self.emit(SessionEvent::Finished {
            id: self.id,
            status,
        });
    }

    /// Drop the child handle, revoke the slave if it was granted, close the
    /// master.
    fn release(&mut self) {
        self.running = None;
        if self.granted {
            if let Some(master) = self.pty.master() {
                if let Err(e) = self.broker.revoke(master) {
                    warn!("Session {}: revoking pty permissions failed: {e}", self.id);
                }
            }
            self.granted = false;
        }
        self.pty.close();
    }

    fn lock_output(&mut self, lock: bool) {
        self.output_locked = lock;
        if let Some(running) = self.running.as_mut() {
            running.locked = lock;
        }
        debug!(
            "Session {}: output {}",
            self.id,
            if lock { "locked" } else { "unlocked" }
        );
    }

    /// Output arrived: report activity once per burst and restart the
    /// silence countdown.
    fn note_activity(&mut self) {
        if !(self.options.monitor_activity || self.options.monitor_silence) {
            return;
        }
        if !self.notified_activity {
            self.notified_activity = true;
            if self.options.monitor_activity {
                self.emit(SessionEvent::Activity(self.id));
            }
        }
        self.arm_silence_timer();
    }

    fn silence_elapsed(&mut self) {
        if self.options.monitor_silence {
            self.emit(SessionEvent::Silence(self.id));
        }
        self.notified_activity = false;
    }

    fn arm_silence_timer(&mut self) {
        let deadline = Instant::now() + self.options.silence_timeout;
        if let Some(running) = self.running.as_mut() {
            running.silence_at = Some(deadline);
        }
    }

    fn disarm_silence_timer(&mut self) {
        if let Some(running) = self.running.as_mut() {
            running.silence_at = None;
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn running_mut(&mut self) -> Result<&mut Running, SessionError> {
        match self.state {
            SessionState::Running => self.running.as_mut().ok_or(SessionError::NotRunning),
            _ => Err(SessionError::NotRunning),
        }
    }

    /// Queue input for the program. Flushed by [`Self::process`].
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let running = self.running_mut()?;
        if !bytes.is_empty() {
            running.pending.push_back(bytes.to_vec());
        }
        Ok(())
    }

    /// Change the window size the program sees.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.running_mut()?;
        self.rows = rows;
        self.cols = cols;
        self.pty.set_window_size(rows, cols)?;
        self.emulation.on_resize(rows, cols);
        debug!("Session {} resized to {rows}x{cols}", self.id);
        Ok(())
    }

    /// Deliver `signal` to the program's process group.
    pub fn signal(&mut self, signal: Signal) -> Result<(), SessionError> {
        let pid = self.running_mut()?.child.pid();
        ChildProcessRunner::signal(pid, signal)
    }

    /// [`Self::signal`] for a raw signal number.
    pub fn send_signal(&mut self, signal: i32) -> Result<(), SessionError> {
        let signal = Signal::try_from(signal).map_err(|_| SessionError::InvalidSignal(signal))?;
        self.signal(signal)
    }

    /// Ask the program to end, escalating to SIGKILL after the grace period.
    ///
    /// Returns once the session is `Terminated`. Terminating a terminated
    /// session does nothing.
    pub async fn terminate(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => return Err(SessionError::NotRunning),
            SessionState::Terminated => return Ok(()),
            SessionState::Running => {}
        }

        let graceful = self.options.terminate_signal;
        if let Err(e) = self.signal(graceful) {
            debug!("Session {}: {graceful} not delivered: {e}", self.id);
        }
        // Only the wait for exit is bounded; teardown runs after it.
        let grace = self.options.grace_period;
        let status = match tokio::time::timeout(grace, self.wait_exit()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "Session {}: still running {}ms after {graceful}, sending SIGKILL",
                    self.id,
                    grace.as_millis()
                );
                if let Err(e) = self.signal(Signal::SIGKILL) {
                    debug!("Session {}: SIGKILL not delivered: {e}", self.id);
                }
                self.wait_exit().await?
            }
        };
        self.finish(status).await;
        Ok(())
    }

    /// End the program immediately with SIGKILL.
    pub async fn kill(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => return Err(SessionError::NotRunning),
            SessionState::Terminated => return Ok(()),
            SessionState::Running => {}
        }
        if let Err(e) = self.signal(Signal::SIGKILL) {
            debug!("Session {}: SIGKILL not delivered: {e}", self.id);
        }
        let status = self.wait_exit().await?;
        self.finish(status).await;
        Ok(())
    }

    /// Forward a scroll lock toggle to the emulation. An emulation that holds
    /// the screen suspends reading from the child until it is released.
    pub fn set_scroll_lock(&mut self, lock: bool) {
        self.emulation.scroll_lock(lock);
        self.apply_emulation_events();
    }

    pub fn is_output_locked(&self) -> bool {
        self.output_locked
    }

    pub fn set_monitor_activity(&mut self, monitor: bool) {
        self.options.monitor_activity = monitor;
        self.notified_activity = false;
    }

    pub fn set_monitor_silence(&mut self, monitor: bool) {
        if self.options.monitor_silence == monitor {
            return;
        }
        self.options.monitor_silence = monitor;
        if monitor {
            self.arm_silence_timer();
        } else if !self.options.monitor_activity {
            self.disarm_silence_timer();
        }
    }

    /// Change the quiet time before [`SessionEvent::Silence`]. A running
    /// silence countdown starts over.
    pub fn set_silence_timeout(&mut self, timeout: Duration) {
        self.options.silence_timeout = timeout;
        if self.options.monitor_silence {
            self.arm_silence_timer();
        }
    }

    pub fn monitors_activity(&self) -> bool {
        self.options.monitor_activity
    }

    pub fn monitors_silence(&self) -> bool {
        self.options.monitor_silence
    }

    pub fn silence_timeout(&self) -> Duration {
        self.options.silence_timeout
    }

    /// Allow or forbid `write(1)` messages from other users (`mesg y/n`).
    pub fn set_writeable(&mut self, writeable: bool) -> Result<(), SessionError> {
        self.running_mut()?;
        self.pty.set_writeable(writeable)
    }

    /// Apply an xterm-style title sequence.
    ///
    /// `what` follows the OSC numbering: 0 sets user title and icon text,
    /// 1 the icon text, 2 the user title, 30 renames the session, 32 sets the
    /// icon name. Other codes are ignored.
    pub fn set_user_title(&mut self, what: u16, caption: &str) {
        let mut changed = false;
        let mut update = |field: &mut String| {
            if field.as_str() != caption {
                caption.clone_into(field);
                changed = true;
            }
        };
        match what {
            0 => {
                update(&mut self.user_title);
                update(&mut self.icon_text);
            }
            1 => update(&mut self.icon_text),
            2 => update(&mut self.user_title),
            30 => update(&mut self.title),
            32 => update(&mut self.icon_name),
            _ => {
                debug!("Session {}: ignoring title code {what}", self.id);
                return;
            }
        }
        if changed {
            self.emit(SessionEvent::TitleChanged(self.id));
        }
    }

    pub fn set_title(&mut self, title: &str) {
        self.set_user_title(30, title);
    }

    pub fn set_icon_text(&mut self, text: &str) {
        self.set_user_title(1, text);
    }

    pub fn set_icon_name(&mut self, name: &str) {
        self.set_user_title(32, name);
    }

    /// Session title, followed by the program's own title when it set one.
    pub fn display_title(&self) -> String {
        if self.user_title.is_empty() {
            self.title.clone()
        } else if self.title.is_empty() {
            self.user_title.clone()
        } else {
            format!("{} - {}", self.title, self.user_title)
        }
    }

    pub fn set_keymap_id(&mut self, keymap_id: &str) {
        keymap_id.clone_into(&mut self.keymap_id);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<Pid> {
        self.running.as_ref().map(|r| r.child.pid())
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Slave device of the running session.
    pub fn device_name(&self) -> Option<&Path> {
        self.pty.device_name()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn user_title(&self) -> &str {
        &self.user_title
    }

    pub fn icon_text(&self) -> &str {
        &self.icon_text
    }

    pub fn icon_name(&self) -> &str {
        &self.icon_name
    }

    pub fn keymap_id(&self) -> &str {
        &self.keymap_id
    }

    /// `(rows, cols)`
    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            if running.child.is_running() {
                if let Err(e) = ChildProcessRunner::signal(running.child.pid(), Signal::SIGKILL) {
                    debug!("Session {}: SIGKILL on drop: {e}", self.id);
                }
            }
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::RecordingBroker;
    use crate::broker::NoBroker;
    use crate::emulation::{TitleTracker, Transcript};
    use grantpty::{BrokerError, Mode};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        session: TerminalSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        transcript: Transcript,
    }

    fn fixture_with(broker: Arc<dyn PermissionBroker>, options: SessionOptions) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let transcript = Transcript::new();
        let emulation = Box::new(TitleTracker::new(transcript.clone()));
        Fixture {
            session: TerminalSession::new(1, options, broker, emulation, tx),
            events: rx,
            transcript,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoBroker), SessionOptions::default())
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn finished(events: &[SessionEvent]) -> Vec<ExitStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Finished { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    async fn finish(session: &mut TerminalSession) {
        tokio::time::timeout(TEST_TIMEOUT, session.run_until_finished())
            .await
            .expect("session did not finish")
            .unwrap();
    }

    async fn wait_for_output(f: &mut Fixture, needle: &str) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !f.transcript.contents_lossy().contains(needle) {
                f.session.process().await.unwrap();
            }
        })
        .await
        .expect("output did not arrive");
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let mut f = fixture();
        f.session.run("echo", &args(&["hi"]), "xterm").unwrap();
        assert_eq!(f.session.state(), SessionState::Running);
        assert!(f.session.device_name().is_some());
        finish(&mut f.session).await;

        assert_eq!(f.session.state(), SessionState::Terminated);
        assert_eq!(f.session.exit_status(), Some(ExitStatus::Exited(0)));
        assert!(f.session.device_name().is_none());
        assert!(f.transcript.contents_lossy().contains("hi"));
        assert_eq!(
            finished(&drain_events(&mut f.events)),
            vec![ExitStatus::Exited(0)]
        );
    }

    #[tokio::test]
    async fn test_exit_code_reaches_finished_event() {
        let mut f = fixture();
        f.session.run("sh", &args(&["-c", "exit 3"]), "").unwrap();
        finish(&mut f.session).await;
        assert_eq!(
            finished(&drain_events(&mut f.events)),
            vec![ExitStatus::Exited(3)]
        );
    }

    #[tokio::test]
    async fn test_run_is_rejected_outside_idle() {
        let mut f = fixture();
        f.session.run("sleep", &args(&["30"]), "xterm").unwrap();
        assert!(matches!(
            f.session.run("true", &[], "xterm"),
            Err(SessionError::AlreadyRunning)
        ));
        f.session.kill().await.unwrap();
        assert!(matches!(
            f.session.run("true", &[], "xterm"),
            Err(SessionError::AlreadyTerminated)
        ));
    }

    #[tokio::test]
    async fn test_input_reaches_program() {
        let mut f = fixture();
        f.session.run("head", &args(&["-n", "1"]), "xterm").unwrap();
        f.session.send_bytes(b"ping\n").unwrap();
        finish(&mut f.session).await;
        assert!(f.transcript.contents_lossy().contains("ping"));
        assert_eq!(f.session.exit_status(), Some(ExitStatus::Exited(0)));
    }

    #[tokio::test]
    async fn test_terminate_sends_hangup() {
        let mut f = fixture();
        f.session.run("sleep", &args(&["30"]), "xterm").unwrap();
        f.session.terminate().await.unwrap();
        assert_eq!(f.session.state(), SessionState::Terminated);
        assert!(matches!(
            f.session.exit_status(),
            Some(ExitStatus::Signaled { signal, .. }) if signal == libc::SIGHUP
        ));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let options = SessionOptions {
            grace_period: Duration::from_millis(200),
            ..SessionOptions::default()
        };
        let mut f = fixture_with(Arc::new(NoBroker), options);
        f.session
            .run(
                "sh",
                &args(&["-c", "trap '' HUP; echo ready; exec sleep 30"]),
                "xterm",
            )
            .unwrap();
        wait_for_output(&mut f, "ready").await;

        tokio::time::timeout(TEST_TIMEOUT, f.session.terminate())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            f.session.exit_status(),
            Some(ExitStatus::Signaled { signal, .. }) if signal == libc::SIGKILL
        ));
    }

    #[tokio::test]
    async fn test_finished_is_emitted_exactly_once() {
        let mut f = fixture();
        f.session.run("sleep", &args(&["30"]), "xterm").unwrap();
        f.session.terminate().await.unwrap();
        f.session.terminate().await.unwrap();
        f.session.kill().await.unwrap();
        assert!(matches!(
            f.session.process().await,
            Err(SessionError::AlreadyTerminated)
        ));
        assert_eq!(finished(&drain_events(&mut f.events)).len(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_running() {
        let mut f = fixture();
        assert!(matches!(f.session.resize(30, 100), Err(SessionError::NotRunning)));
        assert!(matches!(f.session.send_bytes(b"x"), Err(SessionError::NotRunning)));
        assert!(matches!(
            f.session.signal(Signal::SIGINT),
            Err(SessionError::NotRunning)
        ));
        assert!(matches!(f.session.terminate().await, Err(SessionError::NotRunning)));
        assert!(matches!(f.session.process().await, Err(SessionError::NotRunning)));

        f.session.run("true", &[], "xterm").unwrap();
        finish(&mut f.session).await;
        assert!(matches!(f.session.resize(30, 100), Err(SessionError::NotRunning)));
        assert!(matches!(f.session.send_bytes(b"x"), Err(SessionError::NotRunning)));
    }

    #[tokio::test]
    async fn test_resize_while_running() {
        let mut f = fixture();
        f.session.run("sleep", &args(&["30"]), "xterm").unwrap();
        f.session.resize(40, 120).unwrap();
        assert_eq!(f.session.size(), (40, 120));
        f.session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_signal_number() {
        let mut f = fixture();
        f.session.run("sleep", &args(&["30"]), "xterm").unwrap();
        assert!(matches!(
            f.session.send_signal(12345),
            Err(SessionError::InvalidSignal(12345))
        ));
        f.session.send_signal(libc::SIGTERM).unwrap();
        finish(&mut f.session).await;
        assert!(matches!(
            f.session.exit_status(),
            Some(ExitStatus::Signaled { signal, .. }) if signal == libc::SIGTERM
        ));
    }

    #[tokio::test]
    async fn test_refused_grant_aborts_startup() {
        let broker = Arc::new(RecordingBroker::refusing(BrokerError::NotPrivileged));
        let mut f = fixture_with(broker.clone(), SessionOptions::default());

        let err = f.session.run("echo", &args(&["never"]), "xterm").unwrap_err();
        assert!(matches!(err, SessionError::Broker(BrokerError::NotPrivileged)));
        assert!(err.to_string().starts_with("cannot start session"));
        assert_eq!(f.session.state(), SessionState::Idle);
        assert!(f.session.device_name().is_none());
        assert_eq!(broker.calls(), vec![Mode::Grant]);
        assert!(drain_events(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_grant_then_revoke_around_session() {
        let broker = Arc::new(RecordingBroker::default());
        let mut f = fixture_with(broker.clone(), SessionOptions::default());
        f.session.run("true", &[], "xterm").unwrap();
        assert_eq!(broker.calls(), vec![Mode::Grant]);
        finish(&mut f.session).await;
        assert_eq!(broker.calls(), vec![Mode::Grant, Mode::Revoke]);
    }

    #[tokio::test]
    async fn test_exec_failure_releases_pty_and_allows_retry() {
        let broker = Arc::new(RecordingBroker::default());
        let mut f = fixture_with(broker.clone(), SessionOptions::default());

        let err = f
            .session
            .run("/nonexistent/program", &[], "xterm")
            .unwrap_err();
        assert!(matches!(err, SessionError::ExecFailed { .. }));
        assert_eq!(f.session.state(), SessionState::Idle);
        assert!(f.session.device_name().is_none());
        assert_eq!(broker.calls(), vec![Mode::Grant, Mode::Revoke]);

        f.session.run("true", &[], "xterm").unwrap();
        finish(&mut f.session).await;
        assert_eq!(f.session.exit_status(), Some(ExitStatus::Exited(0)));
    }

    #[tokio::test]
    async fn test_drop_releases_pty() {
        let broker = Arc::new(RecordingBroker::default());
        let f = fixture_with(broker.clone(), SessionOptions::default());
        let mut session = f.session;
        session.run("sleep", &args(&["30"]), "xterm").unwrap();
        drop(session);
        assert_eq!(broker.calls(), vec![Mode::Grant, Mode::Revoke]);
    }

    #[tokio::test]
    async fn test_osc_title_reaches_session() {
        let mut f = fixture();
        f.session
            .run("printf", &args(&["\\033]2;building\\007"]), "xterm")
            .unwrap();
        finish(&mut f.session).await;
        assert_eq!(f.session.user_title(), "building");
        assert_eq!(f.session.display_title(), "printf - building");
        assert!(drain_events(&mut f.events).contains(&SessionEvent::TitleChanged(1)));
    }

    #[tokio::test]
    async fn test_finished_title_without_auto_close() {
        let options = SessionOptions {
            auto_close: false,
            ..SessionOptions::default()
        };
        let mut f = fixture_with(Arc::new(NoBroker), options);
        f.session.run("true", &[], "xterm").unwrap();
        finish(&mut f.session).await;
        assert_eq!(f.session.user_title(), FINISHED_TITLE);
    }

    #[tokio::test]
    async fn test_slave_is_not_group_writeable_after_start() {
        use std::os::unix::fs::PermissionsExt;

        let mut f = fixture();
        f.session.run("sleep", &args(&["30"]), "xterm").unwrap();
        let path = f.session.device_name().unwrap().to_path_buf();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o022, 0);

        f.session.set_writeable(true).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o020, 0o020);
        f.session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_is_not_cut_short_by_grace_period() {
        // A detached grandchild keeps the slave open, so the output drain
        // runs its full course after the program itself is gone.
        let options = SessionOptions {
            grace_period: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let mut f = fixture_with(Arc::new(NoBroker), options);
        f.session
            .run(
                "sh",
                &args(&["-c", "setsid sleep 2 & sleep 0.2; echo ready; exec sleep 30"]),
                "xterm",
            )
            .unwrap();
        wait_for_output(&mut f, "ready").await;

        tokio::time::timeout(TEST_TIMEOUT, f.session.terminate())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.session.state(), SessionState::Terminated);
        assert!(matches!(
            f.session.exit_status(),
            Some(ExitStatus::Signaled { signal, .. }) if signal == libc::SIGHUP
        ));
        assert_eq!(finished(&drain_events(&mut f.events)).len(), 1);
    }

    #[tokio::test]
    async fn test_silence_is_reported() {
        let options = SessionOptions {
            monitor_silence: true,
            silence_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        };
        let mut f = fixture_with(Arc::new(NoBroker), options);
        f.session
            .run("sh", &args(&["-c", "echo hi; exec sleep 30"]), "xterm")
            .unwrap();

        let mut seen = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !seen.contains(&SessionEvent::Silence(1)) {
                f.session.process().await.unwrap();
                seen.extend(drain_events(&mut f.events));
            }
        })
        .await
        .expect("no silence reported");
        assert!(!seen.contains(&SessionEvent::Activity(1)));
        f.session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_activity_is_reported_once_per_burst() {
        let options = SessionOptions {
            monitor_activity: true,
            silence_timeout: Duration::from_millis(300),
            ..SessionOptions::default()
        };
        let mut f = fixture_with(Arc::new(NoBroker), options);
        f.session
            .run(
                "sh",
                &args(&["-c", "echo one; echo more; sleep 1; echo two; exec sleep 30"]),
                "xterm",
            )
            .unwrap();
        wait_for_output(&mut f, "two").await;
        f.session.kill().await.unwrap();

        let events = drain_events(&mut f.events);
        let activity = events
            .iter()
            .filter(|e| **e == SessionEvent::Activity(1))
            .count();
        assert_eq!(activity, 2);
        assert!(!events.contains(&SessionEvent::Silence(1)));
    }

    #[tokio::test]
    async fn test_unmonitored_session_reports_no_activity() {
        let mut f = fixture();
        f.session.run("echo", &args(&["quiet"]), "xterm").unwrap();
        finish(&mut f.session).await;
        let events = drain_events(&mut f.events);
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Activity(_) | SessionEvent::Silence(_))));
    }

    #[test]
    fn test_monitor_toggles() {
        let mut f = fixture();
        assert!(!f.session.monitors_activity());
        assert!(!f.session.monitors_silence());
        f.session.set_monitor_activity(true);
        f.session.set_monitor_silence(true);
        f.session.set_silence_timeout(Duration::from_secs(5));
        assert!(f.session.monitors_activity());
        assert!(f.session.monitors_silence());
        assert_eq!(f.session.silence_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_scroll_lock_suspends_output() {
        let mut f = fixture();
        f.session
            .run("sh", &args(&["-c", "echo held; exec sleep 30"]), "xterm")
            .unwrap();
        f.session.set_scroll_lock(true);
        assert!(f.session.is_output_locked());

        let step = tokio::time::timeout(Duration::from_millis(500), f.session.process()).await;
        assert!(step.is_err(), "output was read while locked");
        assert!(f.transcript.contents().is_empty());

        f.session.set_scroll_lock(false);
        assert!(!f.session.is_output_locked());
        wait_for_output(&mut f, "held").await;
        f.session.kill().await.unwrap();
    }

    #[test]
    fn test_title_codes() {
        let mut f = fixture();
        f.session.set_title("shell");
        f.session.set_user_title(0, "vim");
        assert_eq!(f.session.user_title(), "vim");
        assert_eq!(f.session.icon_text(), "vim");
        f.session.set_user_title(1, "icon");
        assert_eq!(f.session.icon_text(), "icon");
        assert_eq!(f.session.user_title(), "vim");
        f.session.set_icon_name("utilities-terminal");
        assert_eq!(f.session.icon_name(), "utilities-terminal");
        f.session.set_user_title(99, "ignored");
        assert_eq!(f.session.display_title(), "shell - vim");

        let events = drain_events(&mut f.events);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| *e == SessionEvent::TitleChanged(1)));
    }

    #[test]
    fn test_unchanged_title_is_silent() {
        let mut f = fixture();
        f.session.set_icon_text("same");
        f.session.set_icon_text("same");
        assert_eq!(drain_events(&mut f.events).len(), 1);
    }

    #[test]
    fn test_keymap_id() {
        let mut f = fixture();
        assert_eq!(f.session.keymap_id(), "");
        f.session.set_keymap_id("vt420pc");
        assert_eq!(f.session.keymap_id(), "vt420pc");
    }

    #[test]
    fn test_options_from_config() {
        let config = SessionConfig {
            grace_period_ms: 500,
            terminate_signal: "TERM".into(),
            auto_close: false,
            ..SessionConfig::default()
        };
        let options = SessionOptions::from_config(&config).unwrap();
        assert_eq!(options.grace_period, Duration::from_millis(500));
        assert_eq!(options.terminate_signal, Signal::SIGTERM);
        assert!(!options.auto_close);
        assert_eq!(options.silence_timeout, DEFAULT_SILENCE_TIMEOUT);
    }
}
