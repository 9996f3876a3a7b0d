//! Error types.

use core::fmt;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the connection, or `close()` was called locally.
    Closed,
    /// An I/O error on the underlying stream.
    Io(std::io::Error),
    /// A frame exceeded the session's maximum message length.
    FrameTooLarge { len: u32, max: u32 },
    /// The peer sent bytes that do not parse as a frame.
    Malformed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max message length {max}")
            }
            Self::Malformed(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Why an [`OpaqueRpc`](crate::OpaqueRpc) did not produce a reply.
#[derive(Debug)]
pub enum RpcError {
    /// The reply has not arrived yet; call `update` again later.
    NotReady,
    /// The RPC was cancelled locally.
    Canceled,
    /// The session failed; the string is the session's error message.
    Session(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "RPC not ready"),
            Self::Canceled => write!(f, "RPC canceled"),
            Self::Session(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RpcError {}
