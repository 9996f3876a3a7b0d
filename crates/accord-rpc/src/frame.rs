//! Wire frame representation and codec.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +----------------+--------------------+------------------+
//! | len: u32 (LE)  | message_id: u64 LE | payload bytes    |
//! +----------------+--------------------+------------------+
//! ```
//!
//! `len` counts the bytes after the prefix, so a valid frame always has
//! `len >= 8`. Message ID 0 is reserved for liveness pings and carries an
//! empty payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::TransportError;

/// Identifier assigned per outgoing request, never reused within a session.
pub type MessageId = u64;

/// Reserved for ping probes and their responses. No real RPC is ever
/// assigned this ID.
pub const PING_MESSAGE_ID: MessageId = 0;

/// Bytes of frame body that precede the payload (the message ID).
pub const FRAME_HEADER_SIZE: usize = 8;

/// A single message: an ID and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: MessageId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_id: MessageId, payload: Bytes) -> Self {
        Self {
            message_id,
            payload,
        }
    }

    /// An empty ping/pong frame.
    pub fn ping() -> Self {
        Self {
            message_id: PING_MESSAGE_ID,
            payload: Bytes::new(),
        }
    }

    /// Encode the frame including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32_le((FRAME_HEADER_SIZE + self.payload.len()) as u32);
        buf.put_u64_le(self.message_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame body (the bytes after the length prefix).
    pub fn decode(body: Bytes) -> Result<Self, TransportError> {
        if body.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::Malformed(format!(
                "frame body of {} bytes is shorter than the {} byte header",
                body.len(),
                FRAME_HEADER_SIZE,
            )));
        }
        let message_id = u64::from_le_bytes(
            body[..FRAME_HEADER_SIZE]
                .try_into()
                .expect("slice length checked above"),
        );
        Ok(Self {
            message_id,
            payload: body.slice(FRAME_HEADER_SIZE..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(42, Bytes::from_static(b"hello"));
        let wire = frame.encode();
        assert_eq!(&wire[..4], &13u32.to_le_bytes());
        let decoded = Frame::decode(wire.slice(4..)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn ping_frame_is_empty_with_reserved_id() {
        let ping = Frame::ping();
        assert_eq!(ping.message_id, PING_MESSAGE_ID);
        assert!(ping.payload.is_empty());

        let decoded = Frame::decode(ping.encode().slice(4..)).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let err = Frame::decode(Bytes::from_static(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }
}
