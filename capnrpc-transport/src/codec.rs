use bytes::{Buf, BufMut, BytesMut};
use capnrpc_core::{Message, MessageError};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Codec for protocol envelopes.
///
/// Each frame is a 4-byte big-endian body length followed by one envelope encoded
/// as a single-key JSON object (`{"call": {...}}`). The limit applies in both
/// directions, so a vat never writes a frame its peer would refuse.
#[derive(Debug, Clone)]
pub struct RpcCodec {
    max_frame_size: usize,
}

impl RpcCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_len(&self, len: usize) -> Result<(), CodecError> {
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let Some(header) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let body_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        self.check_len(body_len)?;

        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len);
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        let message = Message::from_json(&value)?;
        trace!(kind = message.kind(), bytes = body_len, "Decoded envelope");
        Ok(Some(message))
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&message.to_json())?;
        self.check_len(body.len())?;

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a valid envelope: {0}")]
    Envelope(#[from] MessageError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// The bytes arrived intact but do not form an acceptable envelope.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}
