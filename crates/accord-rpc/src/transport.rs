//! Transport traits.

use std::future::Future;

use crate::{Frame, TransportError};

mod mem;
mod stream;

pub use mem::MemTransport;
pub use stream::StreamTransport;

/// A transport moves frames between two peers over a reliable, ordered
/// byte stream (or something that behaves like one).
///
/// Transports are responsible for:
/// - Frame encoding/decoding
/// - Enforcing the session's maximum message length
/// - Delivering frames reliably and in order
///
/// Transports are NOT responsible for:
/// - RPC semantics (message IDs, liveness, timeouts)
/// - Matching responses to requests
///
/// Invariant: only the session's demux task calls `recv_frame`. No other
/// code should touch `recv_frame` directly; this prevents callers from
/// competing for inbound frames.
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to the peer.
    fn send_frame(
        &self,
        frame: Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame from the peer.
    fn recv_frame(&self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Signal close. Non-blocking; in-flight operations observe
    /// [`TransportError::Closed`] on their next call.
    fn close(&self);

    /// Whether the transport is closed or failed.
    fn is_closed(&self) -> bool;
}
