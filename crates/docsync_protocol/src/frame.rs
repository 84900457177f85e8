//! CBOR framing.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Message;
use bytes::Bytes;

/// Largest frame accepted by [`Frame::decode`].
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One encoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Encodes a message.
    pub fn encode(message: &Message) -> ProtocolResult<Self> {
        let mut buf = Vec::new();
        ciborium::into_writer(message, &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if buf.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: buf.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        Ok(Self(Bytes::from(buf)))
    }

    /// Decodes the message carried by this frame.
    pub fn decode(&self) -> ProtocolResult<Message> {
        if self.0.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.0.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        ciborium::from_reader(self.0.as_ref()).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Wraps raw bytes received from a transport.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Encoded length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length frame.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
