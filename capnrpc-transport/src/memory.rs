use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use capnrpc_core::Message;
use tokio::sync::{mpsc, watch};

use crate::transport::{Transport, TransportError};

/// One end of an in-process message pipe. Messages are passed without encoding.
pub struct MemoryTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(watch::channel(false).0);

        let a = MemoryTransport {
            outbound: Mutex::new(Some(a_tx)),
            inbound: tokio::sync::Mutex::new(b_rx),
            closed: closed.clone(),
        };
        let b = MemoryTransport {
            outbound: Mutex::new(Some(b_tx)),
            inbound: tokio::sync::Mutex::new(a_rx),
            closed,
        };
        (a, b)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn receive(&self) -> Result<Option<Message>, TransportError> {
        let message = self.inbound.lock().await.recv().await;
        if message.is_none() {
            self.closed.send_replace(true);
        }
        Ok(message)
    }

    async fn shutdown(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.send_replace(true);
    }

    async fn on_disconnect(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}
