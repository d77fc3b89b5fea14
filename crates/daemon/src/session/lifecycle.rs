//! Per-session state machine.
//!
//! `Connecting → Active → Closing → Closed`. Transitions only move forward;
//! the first caller to reach `Closing` owns teardown.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Process spawn in progress.
    Connecting = 0,
    /// All flows wired and live.
    Active = 1,
    /// Disconnect or exit observed, teardown running.
    Closing = 2,
    /// Process released and registry entry removed.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client transport went away.
    ClientDisconnected,
    /// The shell process ended on its own.
    ProcessExited,
    /// The server is shutting down.
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::ClientDisconnected => "client disconnected",
            CloseReason::ProcessExited => "process exited",
            CloseReason::ServerShutdown => "server shutdown",
        };
        f.write_str(name)
    }
}

/// Atomic, forward-only session state.
#[derive(Debug)]
pub struct SessionLifecycle {
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
}

impl SessionLifecycle {
    /// Creates a lifecycle in the `Connecting` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Connecting as u8),
            reason: OnceLock::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves to `to` if it is later than the current state.
    ///
    /// Returns false when the session is already at or past `to`.
    pub fn advance(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// `Connecting → Active`.
    pub fn activate(&self) -> bool {
        self.advance(SessionState::Active)
    }

    /// Enters `Closing`. Only the first caller gets `true` and records its reason.
    pub fn begin_closing(&self, reason: CloseReason) -> bool {
        if self.advance(SessionState::Closing) {
            let _ = self.reason.set(reason);
            true
        } else {
            false
        }
    }

    /// Enters `Closed`.
    pub fn close(&self) -> bool {
        self.advance(SessionState::Closed)
    }

    /// The reason recorded by the winning `begin_closing` call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
