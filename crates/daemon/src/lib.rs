//! # PtyBridge Daemon Library
//!
//! This crate serves interactive shells to browser terminals. Each WebSocket
//! connection on `/api/terminal` gets its own shell on a pseudo-terminal;
//! output streams back as it is produced, and keystrokes and resizes flow in.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ServerSingleton                          │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                      BridgeServer                         │  │
//! │  │   accept ─▶ handshake ─▶ TransportEndpoint ─▶ run_session │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                                                                 │
//! │  ┌──────────────────┐   ┌────────────────────────────────────┐  │
//! │  │ SessionRegistry  │   │ ProcessHandle (shell on a PTY)     │  │
//! │  └──────────────────┘   └────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, ServerSingleton};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let server = ServerSingleton::global()
//!         .get_or_create(&config.server)
//!         .await?;
//!     println!("listening on {}", server.endpoint_url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: Shell processes, session lifecycle, and the registry
//! - [`transport`]: Client endpoints and the WebSocket transport
//! - [`server`]: Accept loop, session driver, and the singleton

pub mod config;
pub mod logging;
pub mod server;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use session::{
    CloseReason, ConnectionId, ProcessEvent, ProcessHandle, Session, SessionError, SessionInfo,
    SessionRegistry, SessionState, SpawnOptions,
};

pub use transport::websocket::HandshakePolicy;
pub use transport::{RemoteEndpoint, TransportEndpoint};

pub use server::{run_session, BridgeError, BridgeServer, ServerSingleton, SessionOutcome};
