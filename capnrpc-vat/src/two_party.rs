use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use capnrpc_core::{Capability, RpcError};
use capnrpc_transport::{RpcCodec, StreamTransport, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RpcConfig;
use crate::connection::ConnectionHandle;
use crate::system::{BootstrapFactory, PeerId, RpcSystem, VatNetwork};

/// Which end of a two-party connection this vat is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network of exactly two vats joined by one byte stream.
///
/// The client side reaches the server with `connect("server")`; the server side
/// receives the connection once through `accept`.
pub struct TwoPartyVatNetwork {
    side: Side,
    transport: Arc<StreamTransport>,
    handed_out: AtomicBool,
}

impl TwoPartyVatNetwork {
    pub fn new<S>(stream: S, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, side, &RpcConfig::default())
    }

    pub fn with_config<S>(stream: S, side: Side, config: &RpcConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = RpcCodec::with_max_frame_size(config.max_frame_size);
        Self {
            side,
            transport: Arc::new(StreamTransport::with_codec(stream, codec)),
            handed_out: AtomicBool::new(false),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Completes once the underlying stream has closed.
    pub async fn on_disconnect(&self) {
        self.transport.on_disconnect().await;
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        if self.handed_out.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.transport.clone())
    }
}

#[async_trait]
impl VatNetwork for TwoPartyVatNetwork {
    async fn connect(&self, peer: &str) -> Result<Option<Arc<dyn Transport>>, RpcError> {
        if peer == self.side.as_str() {
            return Ok(None);
        }
        if peer != self.side.peer().as_str() {
            return Err(RpcError::failed(format!(
                "Unknown peer '{}' on a two-party network",
                peer
            )));
        }
        self.take_transport()
            .map(Some)
            .ok_or_else(|| RpcError::failed("Two-party connection is already in use"))
    }

    async fn accept(&self) -> Option<(PeerId, Arc<dyn Transport>)> {
        if self.side != Side::Server {
            return None;
        }
        let transport = self.take_transport()?;
        Some((self.side.peer().to_string(), transport))
    }
}

impl fmt::Debug for TwoPartyVatNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoPartyVatNetwork")
            .field("side", &self.side)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Client end of a two-party connection.
#[derive(Debug)]
pub struct TwoPartyClient {
    network: Arc<TwoPartyVatNetwork>,
    system: RpcSystem,
}

impl TwoPartyClient {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_bootstrap(stream, None, RpcConfig::default())
    }

    /// Like `new`, also offering `bootstrap` to the server.
    pub fn with_bootstrap<S>(stream: S, bootstrap: Option<Capability>, config: RpcConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let network = Arc::new(TwoPartyVatNetwork::with_config(stream, Side::Client, &config));
        let factory = bootstrap.map(|cap| Arc::new(cap) as Arc<dyn BootstrapFactory>);
        let system = RpcSystem::new(network.clone(), factory, config);
        Self { network, system }
    }

    /// The server's bootstrap capability.
    pub async fn bootstrap(&self) -> Capability {
        self.system.bootstrap(Side::Server.as_str()).await
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.system.connection(Side::Server.as_str())
    }

    pub async fn on_disconnect(&self) {
        self.network.on_disconnect().await;
    }
}

/// Serves one bootstrap capability to every client that connects.
#[derive(Debug, Clone)]
pub struct TwoPartyServer {
    bootstrap: Capability,
    config: RpcConfig,
}

impl TwoPartyServer {
    pub fn new(bootstrap: Capability) -> Self {
        Self::with_config(bootstrap, RpcConfig::default())
    }

    pub fn with_config(bootstrap: Capability, config: RpcConfig) -> Self {
        Self { bootstrap, config }
    }

    /// Start serving one client over `stream`.
    pub async fn serve<S>(&self, stream: S) -> Result<ConnectionHandle, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let network = Arc::new(TwoPartyVatNetwork::with_config(
            stream,
            Side::Server,
            &self.config,
        ));
        let factory: Arc<dyn BootstrapFactory> = Arc::new(self.bootstrap.clone());
        let system = RpcSystem::new(network, Some(factory), self.config.clone());
        system
            .accept()
            .await
            .ok_or_else(|| RpcError::disconnected("Two-party connection is already in use"))
    }

    /// Accept TCP clients until the listener fails.
    pub async fn listen(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, addr) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
            match self.serve(socket).await {
                Ok(connection) => info!(%addr, id = connection.id(), "Serving client"),
                Err(e) => warn!(%addr, "Failed to serve client: {}", e),
            }
        }
    }
}
