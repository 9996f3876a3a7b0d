//! The handle returned to callers for each outstanding request.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::frame::MessageId;
use crate::session::ClientSession;
use crate::transport::Transport;
use crate::RpcError;

/// Status of an RPC as projected onto its handle by `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    /// The reply has not arrived and the session has not failed.
    NotReady,
    /// The reply arrived; [`OpaqueRpc::reply`] is valid.
    Ok,
    /// The session failed; [`OpaqueRpc::error_message`] explains why.
    Error,
    /// The RPC was cancelled locally.
    Canceled,
}

/// An in-flight (or completed) request whose payload and reply are opaque
/// byte buffers.
///
/// The handle owns a strong reference to its session, so a session stays
/// alive as long as any of its RPCs do. A terminal [`update`] (Ok, Error)
/// or a [`cancel`] clears that reference; afterwards `wait` and `update`
/// are no-ops.
///
/// For cross-task coordination (one task waiting while another cancels),
/// use the session-level operations with [`OpaqueRpc::token`]; the handle
/// methods are the single-owner convenience surface.
///
/// [`update`]: OpaqueRpc::update
/// [`cancel`]: OpaqueRpc::cancel
pub struct OpaqueRpc<T: Transport> {
    pub(crate) session: Option<Arc<ClientSession<T>>>,
    pub(crate) response_token: MessageId,
    pub(crate) status: RpcStatus,
    pub(crate) error_message: String,
    pub(crate) reply: Bytes,
}

impl<T: Transport> OpaqueRpc<T> {
    pub(crate) fn new(session: Arc<ClientSession<T>>, response_token: MessageId) -> Self {
        Self {
            session: Some(session),
            response_token,
            status: RpcStatus::NotReady,
            error_message: String::new(),
            reply: Bytes::new(),
        }
    }

    /// The message ID this request was sent under.
    pub fn token(&self) -> MessageId {
        self.response_token
    }

    pub fn status(&self) -> RpcStatus {
        self.status
    }

    /// The reply payload. Valid only once `status() == RpcStatus::Ok`.
    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    /// The session's error message. Valid once `status()` is `Error` or
    /// `Canceled`.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Wait until the reply arrives, the RPC is cancelled, the session
    /// fails, or `deadline` passes. Returns without projecting the result;
    /// follow with [`update`](OpaqueRpc::update).
    pub async fn wait(&self, deadline: Option<Instant>) {
        if let Some(session) = self.session.clone() {
            session.wait(self.response_token, deadline).await;
        }
    }

    /// Project the shared state onto this handle; see
    /// [`ClientSession::update`].
    pub fn update(&mut self) {
        if let Some(session) = self.session.clone() {
            session.update(self);
        }
    }

    /// Cancel this RPC. Idempotent; a no-op once the handle is terminal.
    pub fn cancel(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.cancel(self.response_token);
        self.status = RpcStatus::Canceled;
        self.error_message = "RPC canceled".to_owned();
        self.reply = Bytes::new();
    }

    /// Consume the handle, yielding the reply or the reason there is none.
    pub fn into_result(self) -> Result<Bytes, RpcError> {
        match self.status {
            RpcStatus::Ok => Ok(self.reply),
            RpcStatus::NotReady => Err(RpcError::NotReady),
            RpcStatus::Canceled => Err(RpcError::Canceled),
            RpcStatus::Error => Err(RpcError::Session(self.error_message)),
        }
    }
}

impl<T: Transport> std::fmt::Debug for OpaqueRpc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueRpc")
            .field("response_token", &self.response_token)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
