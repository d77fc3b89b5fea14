//! Connection-accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::TERMINAL_PATH;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::flows::{run_session, SessionOutcome};
use super::BridgeError;
use crate::config::ServerConfig;
use crate::session::{SessionRegistry, SpawnOptions};
use crate::transport::websocket::{self, HandshakePolicy};

/// Upper bound on the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared state handed to every connection task.
struct ConnectionContext {
    registry: Arc<SessionRegistry>,
    spawn: SpawnOptions,
    policy: HandshakePolicy,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// A listening bridge server.
///
/// Every accepted connection on the terminal path gets its own shell. Tasks
/// are tracked so [`BridgeServer::shutdown`] can wait for all sessions to be
/// torn down.
pub struct BridgeServer {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl BridgeServer {
    /// Binds and starts accepting with the platform shell.
    pub async fn bind(config: &ServerConfig) -> Result<Self, BridgeError> {
        Self::bind_with(config, SpawnOptions::default()).await
    }

    /// Binds and starts accepting, spawning `spawn` for every connection.
    pub async fn bind_with(config: &ServerConfig, spawn: SpawnOptions) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(config.bind_addr.as_str())
            .await
            .map_err(|source| BridgeError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(SessionRegistry::new());
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(ConnectionContext {
            registry: Arc::clone(&registry),
            spawn,
            policy: HandshakePolicy::from_config(config),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        });
        tracker.spawn(accept_loop(listener, ctx));

        tracing::info!(addr = %local_addr, path = TERMINAL_PATH, "Bridge server listening");

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            tracker,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn endpoint_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, TERMINAL_PATH)
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether [`BridgeServer::shutdown`] has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops accepting and tears down every live session.
    ///
    /// Returns once all connection tasks have finished.
    pub async fn shutdown(&self) {
        tracing::info!(sessions = self.registry.len(), "Shutting down bridge server");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Bridge server stopped");
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_ctx = Arc::clone(&ctx);
                    ctx.tracker.spawn(async move {
                        log_outcome(peer, handle_connection(stream, &conn_ctx).await);
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    tracing::debug!("Accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    ctx: &ConnectionContext,
) -> Result<SessionOutcome, BridgeError> {
    let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, websocket::accept(stream, &ctx.policy))
        .await
        .map_err(|_| BridgeError::HandshakeTimeout)??;

    let id = Uuid::new_v4().to_string();
    let endpoint = websocket::attach(ws, id, &ctx.tracker);

    let outcome = run_session(endpoint, &ctx.registry, &ctx.spawn, ctx.shutdown.clone()).await?;
    Ok(outcome)
}

fn log_outcome(peer: SocketAddr, result: Result<SessionOutcome, BridgeError>) {
    match result {
        Ok(outcome) => tracing::debug!(
            %peer,
            connection_id = %outcome.id,
            reason = %outcome.reason,
            exit_code = ?outcome.exit.map(|e| e.exit_code),
            "Connection finished"
        ),
        Err(BridgeError::Handshake(e)) => {
            tracing::debug!(%peer, error = %e, "Connection dropped during handshake")
        }
        Err(e) => tracing::warn!(%peer, error = %e, "Connection failed"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn loopback() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_reports_address_and_url() {
        let server = BridgeServer::bind(&loopback()).await.unwrap();

        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(
            server.endpoint_url(),
            format!("ws://127.0.0.1:{}/api/terminal", server.local_addr().port())
        );
        assert!(server.registry().is_empty());

        server.shutdown().await;
        assert!(server.is_shutting_down());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let first = BridgeServer::bind(&loopback()).await.unwrap();
        let config = ServerConfig {
            bind_addr: first.local_addr().to_string(),
            ..ServerConfig::default()
        };

        let result = BridgeServer::bind(&config).await;
        assert!(matches!(result, Err(BridgeError::Bind { .. })));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let config = ServerConfig {
            bind_addr: "not an address".to_string(),
            ..ServerConfig::default()
        };
        let result = BridgeServer::bind(&config).await;
        assert!(matches!(result, Err(BridgeError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_is_repeatable() {
        let server = BridgeServer::bind(&loopback()).await.unwrap();
        server.shutdown().await;
        server.shutdown().await;
    }
}
