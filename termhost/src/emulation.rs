//! The emulation side of the byte bridge.
//!
//! A session hands every block read from the pty master to its
//! [`Emulation`] and then drains the events the emulation produced. Rendering
//! is somebody else's business; the implementations here only look for the
//! few control sequences a session itself has to act on.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};
use vte::{Params, Parser, Perform};

/// Something the emulation wants the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulationEvent {
    /// Bytes to send to the child, e.g. answers to status queries.
    Write(Vec<u8>),
    /// An OSC title sequence, numbered like xterm (0, 1, 2, 30, 32).
    UserTitle { what: u16, caption: String },
    /// The child asked for a new window size.
    SizeRequest { rows: u16, cols: u16 },
    Bell,
    /// Suspend (`true`) or resume (`false`) reading from the child, e.g.
    /// while the user holds the screen with scroll lock.
    LockPty(bool),
}

/// Consumer of pty output.
pub trait Emulation: Send {
    /// Process one block of output from the child.
    fn receive_block(&mut self, bytes: &[u8]);

    /// Events produced since the last call, oldest first.
    fn take_events(&mut self) -> Vec<EmulationEvent>;

    /// The session's geometry changed.
    fn on_resize(&mut self, _rows: u16, _cols: u16) {}

    /// The user toggled scroll lock. Emulations that can hold the screen
    /// answer with [`EmulationEvent::LockPty`]; the rest ignore it.
    fn scroll_lock(&mut self, _lock: bool) {}
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NullEmulation;

impl Emulation for NullEmulation {
    fn receive_block(&mut self, _bytes: &[u8]) {}

    fn take_events(&mut self) -> Vec<EmulationEvent> {
        Vec::new()
    }
}

/// A cloneable, shared output buffer.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<u8>>>);

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for Transcript {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copies output to a writer and reports title, bell, status and resize
/// sequences as events.
pub struct TitleTracker<W> {
    out: W,
    parser: Parser,
    events: Events,
    rows: u16,
    cols: u16,
    held: bool,
}

impl<W: Write + Send> TitleTracker<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            parser: Parser::new(),
            events: Events::default(),
            rows: 0,
            cols: 0,
            held: false,
        }
    }

    /// Last geometry reported through [`Emulation::on_resize`].
    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// Whether scroll lock currently holds the screen.
    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Emulation for TitleTracker<W> {
    fn receive_block(&mut self, bytes: &[u8]) {
        if let Err(e) = self.out.write_all(bytes).and_then(|()| self.out.flush()) {
            debug!("Dropping output block of {} bytes: {e}", bytes.len());
        }
        self.parser.advance(&mut self.events, bytes);
    }

    fn take_events(&mut self) -> Vec<EmulationEvent> {
        std::mem::take(&mut self.events.0)
    }

    fn on_resize(&mut self, rows: u16, cols: u16) {
        self.rows = rows;
        self.cols = cols;
    }

    fn scroll_lock(&mut self, lock: bool) {
        if self.held != lock {
            self.held = lock;
            self.events.0.push(EmulationEvent::LockPty(lock));
        }
    }
}

#[derive(Default)]
struct Events(Vec<EmulationEvent>);

impl Perform for Events {
    fn execute(&mut self, byte: u8) {
        if byte == 0x07 {
            self.0.push(EmulationEvent::Bell);
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let [what, rest @ ..] = params else {
            return;
        };
        let Some(what) = std::str::from_utf8(what)
            .ok()
            .and_then(|w| w.parse::<u16>().ok())
        else {
            return;
        };
        if !matches!(what, 0 | 1 | 2 | 30 | 32) || rest.is_empty() {
            return;
        }
        // Captions may contain ';', which the parser splits on.
        let caption = rest
            .iter()
            .map(|p| String::from_utf8_lossy(p))
            .collect::<Vec<_>>()
            .join(";");
        trace!("OSC {what}: {caption}");
        self.0.push(EmulationEvent::UserTitle { what, caption });
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if ignore || !intermediates.is_empty() {
            return;
        }
        let params: Vec<u16> = params.iter().flatten().copied().collect();
        match (action, params.as_slice()) {
            // Device status report: answer "terminal OK".
            ('n', [5]) => self.0.push(EmulationEvent::Write(b"\x1b[0n".to_vec())),
            // Window manipulation: resize text area to rows x cols.
            ('t', [8, rows, cols]) => self.0.push(EmulationEvent::SizeRequest {
                rows: *rows,
                cols: *cols,
            }),
            _ => {}
        }
    }
}
