use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::frame::FRAME_HEADER_SIZE;
use crate::{Frame, TransportError};

use super::Transport;

/// Frame transport over any async byte stream (normally a `TcpStream`).
///
/// Frames are length-prefixed; see [`Frame`] for the wire layout. Both
/// directions enforce `max_message_length` on the payload: an oversized
/// outbound frame fails the send, an oversized inbound length prefix fails
/// the receive (and therefore kills the session, since the stream position
/// is no longer trustworthy).
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("max_message_length", &self.inner.max_message_length)
            .finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    max_message_length: u32,
}

impl StreamTransport {
    pub fn new<S>(stream: S, max_message_length: u32) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                max_message_length,
            }),
        }
    }

    /// A connected in-process pair, useful in tests.
    pub fn pair(max_message_length: u32) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (
            Self::new(a, max_message_length),
            Self::new(b, max_message_length),
        )
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Transport for StreamTransport {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        if frame.payload.len() > self.inner.max_message_length as usize {
            return Err(TransportError::FrameTooLarge {
                len: frame.payload.len() as u32,
                max: self.inner.max_message_length,
            });
        }

        let wire = frame.encode();
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        let body_len = u32::from_le_bytes(len_buf) as usize;
        if body_len < FRAME_HEADER_SIZE {
            return Err(TransportError::Malformed(format!(
                "length prefix {body_len} is shorter than the frame header"
            )));
        }
        let payload_len = body_len - FRAME_HEADER_SIZE;
        if payload_len > self.inner.max_message_length as usize {
            return Err(TransportError::FrameTooLarge {
                len: payload_len as u32,
                max: self.inner.max_message_length,
            });
        }

        let mut body = BytesMut::zeroed(body_len);
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        Frame::decode(body.freeze())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (a, b) = StreamTransport::pair(1024);

        a.send_frame(Frame::new(7, Bytes::from_static(b"payload")))
            .await
            .unwrap();
        let got = b.recv_frame().await.unwrap();
        assert_eq!(got.message_id, 7);
        assert_eq!(&got.payload[..], b"payload");

        b.send_frame(Frame::ping()).await.unwrap();
        let pong = a.recv_frame().await.unwrap();
        assert_eq!(pong.message_id, 0);
        assert!(pong.payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_send_is_rejected() {
        let (a, _b) = StreamTransport::pair(4);
        let err = a
            .send_frame(Frame::new(1, Bytes::from_static(b"too large")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        // The sender allows large messages, the receiver does not.
        let (a_io, b_io) = tokio::io::duplex(65536);
        let a = StreamTransport::new(a_io, 1 << 20);
        let b = StreamTransport::new(b_io, 4);

        a.send_frame(Frame::new(1, Bytes::from_static(b"0123456789")))
            .await
            .unwrap();
        let err = b.recv_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn peer_drop_reads_as_closed() {
        let (a, b) = StreamTransport::pair(1024);
        drop(b);
        let err = a.recv_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
