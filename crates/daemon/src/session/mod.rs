//! Session management module.
//!
//! This module provides shell spawning on a PTY, the per-session state
//! machine, and the registry that maps connections to their sessions.

pub mod lifecycle;
pub mod pty;
pub mod registry;

pub use lifecycle::{CloseReason, SessionLifecycle, SessionState};
pub use pty::{
    default_shell, ConnectionId, ProcessEvent, ProcessHandle, SessionError, SpawnOptions,
};
pub use registry::{Session, SessionInfo, SessionRegistry};
