use async_trait::async_trait;
use capnrpc_core::{Message, RpcError};
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// The peer sent a frame that does not decode to a valid envelope.
    /// The stream itself is still usable, so the connection can still answer with `Abort`.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(self, TransportError::Codec(e) if e.is_malformed())
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        RpcError::disconnected(err.to_string())
    }
}

/// Bidirectional stream of protocol envelopes between two vats.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a message for delivery. Never blocks; fails once the transport is closed.
    fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Next inbound message, or `None` at end of stream.
    async fn receive(&self) -> Result<Option<Message>, TransportError>;

    /// Flush queued messages and close the outbound direction.
    async fn shutdown(&self);

    /// Completes once the transport has closed in either direction.
    async fn on_disconnect(&self);
}
