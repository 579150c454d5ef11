use std::sync::Arc;

use async_trait::async_trait;
use capnrpc_core::{Capability, RpcError};
use capnrpc_transport::Transport;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::connection::{spawn_connection, ConnectionHandle};

/// Name of a vat on a network.
pub type PeerId = String;

/// A set of vats this one can talk to.
#[async_trait]
pub trait VatNetwork: Send + Sync {
    /// Open a transport to `peer`, or `Ok(None)` if `peer` is this vat.
    async fn connect(&self, peer: &str) -> Result<Option<Arc<dyn Transport>>, RpcError>;

    /// Wait for the next inbound connection. `None` once no more can arrive.
    async fn accept(&self) -> Option<(PeerId, Arc<dyn Transport>)>;
}

/// Chooses the capability a connecting peer receives when it bootstraps.
pub trait BootstrapFactory: Send + Sync {
    fn create_for(&self, peer: &str) -> Capability;
}

/// Every peer gets the same capability.
impl BootstrapFactory for Capability {
    fn create_for(&self, _peer: &str) -> Capability {
        self.clone()
    }
}

/// Process-level entry point: one connection per peer over a `VatNetwork`.
pub struct RpcSystem {
    network: Arc<dyn VatNetwork>,
    bootstrap: Option<Arc<dyn BootstrapFactory>>,
    config: RpcConfig,
    connections: Arc<DashMap<PeerId, ConnectionHandle>>,
}

impl RpcSystem {
    pub fn new(
        network: Arc<dyn VatNetwork>,
        bootstrap: Option<Arc<dyn BootstrapFactory>>,
        config: RpcConfig,
    ) -> Self {
        Self {
            network,
            bootstrap,
            config,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// The bootstrap capability of `peer`, connecting first if needed.
    pub async fn bootstrap(&self, peer: &str) -> Capability {
        if let Some(connection) = self.connection(peer) {
            return connection.bootstrap();
        }

        match self.network.connect(peer).await {
            Ok(Some(transport)) => {
                let connection = match self.connection(peer) {
                    // Someone else connected while we were waiting.
                    Some(existing) => {
                        drop(transport);
                        existing
                    }
                    None => self.register(peer, transport),
                };
                connection.bootstrap()
            }
            Ok(None) => {
                debug!(peer, "Bootstrapping from ourselves");
                match &self.bootstrap {
                    Some(factory) => factory.create_for(peer),
                    None => Capability::broken(RpcError::failed(
                        "This vat does not expose a bootstrap interface",
                    )),
                }
            }
            Err(e) => {
                warn!(peer, "Failed to connect: {}", e);
                Capability::broken(e)
            }
        }
    }

    /// Accept one inbound connection. `None` once the network has no more to offer.
    pub async fn accept(&self) -> Option<ConnectionHandle> {
        let (peer, transport) = self.network.accept().await?;
        info!(peer = %peer, "Accepted connection");
        Some(self.register(&peer, transport))
    }

    /// Accept inbound connections until the network runs dry.
    pub async fn run(&self) {
        while self.accept().await.is_some() {}
        debug!("Accept loop finished");
    }

    /// The live connection to `peer`, if any.
    pub fn connection(&self, peer: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(peer)
            .filter(|connection| connection.is_active())
            .map(|connection| connection.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn register(&self, peer: &str, transport: Arc<dyn Transport>) -> ConnectionHandle {
        let bootstrap = self
            .bootstrap
            .as_ref()
            .map(|factory| factory.create_for(peer));
        let connection = spawn_connection(peer, transport, bootstrap, self.config.clone());
        self.connections
            .insert(peer.to_string(), connection.clone());

        // Forget the connection once it closes, unless it has been replaced already.
        let connections = self.connections.clone();
        let watched = connection.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            watched.on_disconnect().await;
            connections.remove_if(&peer, |_, current| current.id() == watched.id());
            debug!(peer = %peer, "Connection removed from registry");
        });

        connection
    }
}

impl std::fmt::Debug for RpcSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSystem")
            .field("connections", &self.connections.len())
            .field("config", &self.config)
            .finish()
    }
}
