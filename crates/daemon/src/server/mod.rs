//! Bridge server.
//!
//! [`BridgeServer`] accepts WebSocket connections and runs one shell session
//! per connection via [`run_session`]. [`ServerSingleton`] guards the
//! process-wide instance.

pub mod bridge;
pub mod flows;
pub mod singleton;

pub use bridge::BridgeServer;
pub use flows::{run_session, SessionOutcome};
pub use singleton::ServerSingleton;

use thiserror::Error;

use crate::session::SessionError;

/// Errors raised by the bridge server.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The listening socket could not be created.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The WebSocket upgrade failed or was rejected.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    /// The client did not complete the upgrade in time.
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,

    /// Session setup failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
