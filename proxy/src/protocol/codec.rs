//! Frame codec for backend connections
//!
//! Splits the byte stream coming from a backend into complete tagged messages
//! (tag, Int32 length, body) and passes already framed frontend messages
//! through unchanged.

use crate::error::{ProxyError, Result};
use crate::protocol::message::HEADER_LEN;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest backend message the codec accepts
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Frame codec for backend connections
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    /// Create a codec with the given message size limit
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length < 4 {
            return Err(ProxyError::Protocol(format!(
                "Invalid message length {} for '{}'",
                length, src[0] as char
            )));
        }
        if length > self.max_message_size {
            return Err(ProxyError::Protocol(format!(
                "Message too large: {} bytes",
                length
            )));
        }

        let total = 1 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total)))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
