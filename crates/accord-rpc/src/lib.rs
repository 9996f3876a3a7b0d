//! accord-rpc: the client-side RPC session core of the accord consensus
//! service.
//!
//! This crate provides:
//! - A multiplexed client session ([`ClientSession`]) over one connection,
//!   with per-request handles ([`OpaqueRpc`]), liveness pings, and
//!   session-wide failure semantics
//! - The wire frame and codec ([`Frame`])
//! - Transports ([`Transport`], [`StreamTransport`], [`MemTransport`])
//!
//! Request and reply payloads are opaque byte buffers; marshalling belongs
//! to the RPC layer above this crate.

mod address;
mod error;
mod frame;
mod rpc;
mod session;
mod transport;

pub use address::ServerAddress;
pub use error::{RpcError, TransportError};
pub use frame::{Frame, MessageId, FRAME_HEADER_SIZE, PING_MESSAGE_ID};
pub use rpc::{OpaqueRpc, RpcStatus};
pub use session::{ClientSession, CONNECT_MAX_DEADLINE, TIMEOUT_MS};
pub use transport::{MemTransport, StreamTransport, Transport};
