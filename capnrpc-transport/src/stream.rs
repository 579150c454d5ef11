use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use capnrpc_core::Message;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::RpcCodec;
use crate::transport::{Transport, TransportError};

/// Transport over any duplex byte stream (TCP socket, Unix socket, in-process pipe).
///
/// Two pumps run per stream: a writer that drains the outbound queue into
/// length-prefixed frames, and a reader that decodes frames into the inbound queue.
pub struct StreamTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Message, TransportError>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codec(stream, RpcCodec::new())
    }

    pub fn with_codec<S>(stream: S, codec: RpcCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(watch::channel(false).0);

        let mut frames_in = FramedRead::new(read_half, codec.clone());
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                match frames_in.next().await {
                    Some(Ok(message)) => {
                        if in_tx.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Failed to read frame: {}", e);
                        let _ = in_tx.send(Err(e.into()));
                        break;
                    }
                    None => {
                        debug!("Stream reached end of input");
                        break;
                    }
                }
            }
            reader_closed.send_replace(true);
        });

        let mut frames_out = FramedWrite::new(write_half, codec);
        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = frames_out.send(message).await {
                    warn!("Failed to write frame: {}", e);
                    writer_closed.send_replace(true);
                    return;
                }
            }
            // All senders gone: flush and half-close so the peer sees EOF.
            if let Err(e) = frames_out.close().await {
                debug!("Error closing stream: {}", e);
            }
        });

        Self {
            outbound: Mutex::new(Some(out_tx)),
            inbound: tokio::sync::Mutex::new(in_rx),
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn receive(&self) -> Result<Option<Message>, TransportError> {
        match self.inbound.lock().await.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn shutdown(&self) {
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        self.closed.send_replace(true);
    }

    async fn on_disconnect(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}
