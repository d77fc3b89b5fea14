//! Registry of live sessions keyed by connection.
//!
//! Each accepted connection registers exactly one [`Session`]. Entries are
//! added once the shell is spawned and removed during teardown.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::TerminalSize;

use super::lifecycle::{CloseReason, SessionLifecycle, SessionState};
use super::pty::{ConnectionId, ProcessHandle, SessionError};

/// One connection paired with the shell it owns.
pub struct Session {
    id: ConnectionId,
    process: Arc<ProcessHandle>,
    lifecycle: SessionLifecycle,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    pub fn new(id: ConnectionId, process: Arc<ProcessHandle>) -> Self {
        Self {
            id,
            process,
            lifecycle: SessionLifecycle::new(),
        }
    }

    /// The connection this session belongs to.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The shell process.
    pub fn process(&self) -> &Arc<ProcessHandle> {
        &self.process
    }

    /// The session's state machine.
    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    /// Kills the process and removes the registry entry.
    ///
    /// Runs at most once per session; later calls return false and do nothing.
    pub async fn teardown(&self, registry: &SessionRegistry, reason: CloseReason) -> bool {
        if !self.lifecycle.begin_closing(reason) {
            return false;
        }

        if let Err(e) = self.process.kill().await {
            tracing::warn!(connection_id = %self.id, error = %e, "Failed to kill shell");
        }
        registry.remove(&self.id);
        self.lifecycle.close();

        tracing::info!(
            connection_id = %self.id,
            pid = ?self.process.pid(),
            reason = %reason,
            "Session closed"
        );

        true
    }
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Connection identity.
    pub id: ConnectionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current PTY geometry, if it could be queried.
    pub size: Option<TerminalSize>,
    /// Lifecycle state.
    pub state: SessionState,
}

/// Thread-safe session registry backed by DashMap.
///
/// Setup and teardown of a connection only ever touch that connection's key.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Arc<Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers a session under its connection id.
    pub fn put(&self, session: Arc<Session>) -> Result<(), SessionError> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => Err(SessionError::DuplicateConnection(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Looks up a session.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a session. Removing an absent id is not an error.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Whether a session is registered for `id`.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All registered sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of one session.
    pub async fn info(&self, id: &ConnectionId) -> Option<SessionInfo> {
        let session = self.get(id)?;
        Some(snapshot(&session).await)
    }

    /// Snapshot of every session.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::with_capacity(self.len());
        for session in self.sessions() {
            infos.push(snapshot(&session).await);
        }
        infos
    }
}

async fn snapshot(session: &Session) -> SessionInfo {
    SessionInfo {
        id: session.id().clone(),
        pid: session.process().pid(),
        size: session.process().size().await.ok(),
        state: session.lifecycle().state(),
    }
}
