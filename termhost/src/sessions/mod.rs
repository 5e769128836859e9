//! Session lifecycle management.
//!
//! [`SessionRegistry`] is the single authority for creating, looking up and
//! destroying terminal sessions. It hands out increasing ids, enforces the
//! `max_sessions` limit and owns the receiving end of the [`SessionEvent`]
//! channel every session reports into.
//!
//! ## Concurrency
//!
//! The registry is owned by one task, which also drives the sessions'
//! [`TerminalSession::process`] loops through [`SessionRegistry::get_mut`].
//! Sessions never talk to each other; they only send events.

pub mod session;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::{self, PermissionBroker};
use crate::config::{Config, ConfigError};
use crate::emulation::Emulation;
use crate::error::SessionError;
use session::{SessionEvent, SessionId, SessionOptions, SessionState, TerminalSession};

/// Summary of a session returned by [`SessionRegistry::list_sessions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionListItem {
    pub id: SessionId,
    pub state: SessionState,
    pub program: String,
    pub title: String,
    pub pid: Option<i32>,
    /// Exit code in shell convention, once terminated.
    pub exit_code: Option<i32>,
}

/// Owns the pool of terminal sessions.
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, TerminalSession>,
    next_id: SessionId,
    max_sessions: usize,
    options: SessionOptions,
    broker: Arc<dyn PermissionBroker>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRegistry {
    /// Create an empty registry. Events from all its sessions arrive on the
    /// returned receiver.
    pub fn new(
        max_sessions: usize,
        options: SessionOptions,
        broker: Arc<dyn PermissionBroker>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            sessions: BTreeMap::new(),
            next_id: 1,
            max_sessions,
            options,
            broker,
            events: tx,
        };
        (registry, rx)
    }

    pub fn from_config(
        config: &Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ConfigError> {
        Ok(Self::new(
            config.registry.max_sessions,
            SessionOptions::from_config(&config.session)?,
            broker::from_config(&config.broker),
        ))
    }

    /// Create an idle session wired to `emulation`. Returns its id.
    ///
    /// Terminated sessions still count against the limit until they are
    /// removed or swept.
    pub fn create_session(
        &mut self,
        emulation: Box<dyn Emulation>,
    ) -> Result<SessionId, SessionError> {
        if self.sessions.len() >= self.max_sessions {
            warn!("Session limit reached ({})", self.max_sessions);
            return Err(SessionError::SessionLimit(self.max_sessions));
        }
        let id = self.next_id;
        self.next_id += 1;
        let session = TerminalSession::new(
            id,
            self.options.clone(),
            Arc::clone(&self.broker),
            emulation,
            self.events.clone(),
        );
        self.sessions.insert(id, session);
        info!("Created session {id}, total: {}", self.sessions.len());
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&TerminalSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut TerminalSession> {
        self.sessions.get_mut(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// All sessions, ordered by id.
    pub fn list_sessions(&self) -> Vec<SessionListItem> {
        self.sessions
            .values()
            .map(|s| SessionListItem {
                id: s.id(),
                state: s.state(),
                program: s.program().to_string(),
                title: s.display_title(),
                pid: s.pid().map(|p| p.as_raw()),
                exit_code: s.exit_status().map(|st| st.code()),
            })
            .collect()
    }

    /// Remove a session. A running one is killed and its pty released when
    /// it is dropped.
    pub fn remove(&mut self, id: SessionId) -> Option<TerminalSession> {
        let session = self.sessions.remove(&id)?;
        info!(
            "Removed session {id} ({}), remaining: {}",
            session.state(),
            self.sessions.len()
        );
        Some(session)
    }

    /// Drop every terminated session. Returns the removed ids.
    pub fn sweep(&mut self) -> Vec<SessionId> {
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Terminated)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.sessions.remove(id);
        }
        if !dead.is_empty() {
            info!(
                "Swept {} terminated session(s), remaining: {}",
                dead.len(),
                self.sessions.len()
            );
        }
        dead
    }

    /// Terminate all running sessions concurrently (used during shutdown).
    ///
    /// Each session gets its own grace period before SIGKILL.
    pub async fn terminate_all(&mut self) {
        let running: Vec<&mut TerminalSession> = self
            .sessions
            .values_mut()
            .filter(|s| s.state() == SessionState::Running)
            .collect();
        if running.is_empty() {
            return;
        }
        let count = running.len();
        let results = futures::future::join_all(running.into_iter().map(|s| async move {
            let id = s.id();
            (id, s.terminate().await)
        }))
        .await;
        for (id, result) in results {
            if let Err(e) = result {
                warn!("Session {id}: terminate failed: {e}");
            }
        }
        info!("Shut down {count} session(s)");
    }
}
