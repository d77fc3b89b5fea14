//! Construct-once holder for the bridge server.
//!
//! The first [`ServerSingleton::get_or_create`] binds the listener; every
//! later call returns the same instance without touching the network.
//! [`ServerSingleton::global`] is the process-wide holder used by the binary;
//! embedders and tests can own their own.

use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;

use super::{BridgeError, BridgeServer};
use crate::config::ServerConfig;
use crate::session::SpawnOptions;

/// Holds at most one [`BridgeServer`].
#[derive(Default)]
pub struct ServerSingleton {
    cell: OnceCell<Arc<BridgeServer>>,
}

impl ServerSingleton {
    /// Creates an empty holder.
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// The process-wide holder.
    pub fn global() -> &'static ServerSingleton {
        static GLOBAL: OnceLock<ServerSingleton> = OnceLock::new();
        GLOBAL.get_or_init(ServerSingleton::new)
    }

    /// Returns the server, binding it on first use with the platform shell.
    pub async fn get_or_create(&self, config: &ServerConfig) -> Result<Arc<BridgeServer>, BridgeError> {
        self.get_or_create_with(config, SpawnOptions::default()).await
    }

    /// Returns the server, binding it on first use.
    ///
    /// Arguments are ignored once a server exists. A failed bind is returned
    /// to the caller and leaves the holder empty.
    pub async fn get_or_create_with(
        &self,
        config: &ServerConfig,
        spawn: SpawnOptions,
    ) -> Result<Arc<BridgeServer>, BridgeError> {
        if let Some(server) = self.cell.get() {
            tracing::debug!(addr = %server.local_addr(), "Reusing existing bridge server");
            return Ok(Arc::clone(server));
        }

        let server = self
            .cell
            .get_or_try_init(|| async move { BridgeServer::bind_with(config, spawn).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(server))
    }

    /// The server, if one has been created.
    pub fn get(&self) -> Option<Arc<BridgeServer>> {
        self.cell.get().cloned()
    }
}
