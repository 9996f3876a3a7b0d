//! A long-lived, multiplexed request/response session to one server.
//!
//! One `ClientSession` owns one connection. Any number of caller tasks may
//! submit requests concurrently; a single demux task (the only caller of
//! `recv_frame`) routes inbound frames to the per-request response slots.
//!
//! ```text
//!  caller tasks                         demux task
//!  ───────────                          ──────────
//!  send_request ──┐                ┌── recv_frame loop
//!                 ▼                ▼
//!           ┌───────────────────────────┐
//!           │ responses: id -> slot     │   one parking_lot lock
//!           │ num_active_rpcs, ping,    │
//!           │ error_message, timer      │
//!           └───────────────────────────┘
//!                 ▲                │
//!  wait/update ───┘                └── liveness timer (ping, expire)
//! ```
//!
//! While requests are outstanding, a timer watches for inbound silence:
//! after [`TIMEOUT_MS`] with no frame it sends a ping (message ID 0), and
//! after another [`TIMEOUT_MS`] without the ping response it declares the
//! session dead. Any inbound frame proves liveness and resets the clock.
//!
//! Sessions fail as a unit: connection errors, disconnects, and liveness
//! timeouts set a session-wide error message exactly once, and every
//! current and future RPC on the session reports it through `update`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::ServerAddress;
use crate::frame::{Frame, MessageId, PING_MESSAGE_ID};
use crate::rpc::{OpaqueRpc, RpcStatus};
use crate::transport::{StreamTransport, Transport};
use crate::TransportError;

/// Milliseconds of inbound silence (while requests are outstanding) before
/// the client gets suspicious and sends a ping, and then the deadline for
/// the ping response. Ideally this would sit near the 99th percentile of
/// RPC latency; how it interacts with TCP retransmission timers is an open
/// tuning question. 100 ms is the shipped default.
pub const TIMEOUT_MS: u64 = 100;

/// Upper bound applied to the caller-supplied connect deadline. TCP
/// connection timeouts in the wild can be ridiculously long; past this the
/// caller most likely wants to retry anyway.
pub const CONNECT_MAX_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseStatus {
    Waiting,
    HasReply,
    Canceled,
}

/// Per-request state, guarded by the session lock.
struct Response {
    status: ResponseStatus,
    reply: Bytes,
    /// True while some task is blocked in `wait` on this slot. `cancel`
    /// reads it to decide whether to remove the slot or defer to the
    /// waiter.
    has_waiter: bool,
    ready: Arc<Notify>,
}

impl Response {
    fn new() -> Self {
        Self {
            status: ResponseStatus::Waiting,
            reply: Bytes::new(),
            has_waiter: false,
            ready: Arc::new(Notify::new()),
        }
    }
}

/// Mutable session state, all behind one lock.
struct Shared {
    next_message_id: MessageId,
    responses: HashMap<MessageId, Response>,
    /// Empty while healthy. Once non-empty it never changes; the session
    /// is terminally failed and every RPC reports this message.
    error_message: String,
    /// Count of `Waiting` slots in `responses`.
    num_active_rpcs: usize,
    /// True iff a ping probe is outstanding. Meaningful only while
    /// `num_active_rpcs > 0`.
    active_ping: bool,
    /// Bumped on every schedule and deschedule. A timer task that wakes
    /// with a stale epoch was superseded and does nothing, which is also
    /// how a pending timer is cancelled without extra machinery.
    timer_epoch: u64,
}

impl Shared {
    fn new() -> Self {
        Self {
            next_message_id: 1, // 0 is reserved for PING_MESSAGE_ID
            responses: HashMap::new(),
            error_message: String::new(),
            num_active_rpcs: 0,
            active_ping: false,
            timer_epoch: 0,
        }
    }

    fn born_dead(error_message: String) -> Self {
        Self {
            error_message,
            ..Self::new()
        }
    }

    fn deschedule_timer(&mut self) {
        self.timer_epoch += 1;
    }

    /// Fail the session: record the message and wake every waiter so
    /// blocked `wait` calls can observe it. Callers check that the session
    /// has not already failed.
    fn fail(&mut self, message: String) {
        debug_assert!(self.error_message.is_empty());
        self.error_message = message;
        for response in self.responses.values() {
            response.ready.notify_waiters();
        }
    }
}

/// A client session to one server. See the module docs for the overall
/// shape; construct with [`ClientSession::connect`] (or
/// [`ClientSession::with_transport`] over an arbitrary transport).
///
/// Construction failures are not process failures: `connect` always
/// returns a session, and one that failed to connect simply reports its
/// error through every subsequent `update`.
pub struct ClientSession<T: Transport> {
    address: ServerAddress,
    /// `None` when construction failed before a transport existed; such a
    /// born-dead session skips sends silently.
    transport: Option<Arc<T>>,
    shared: Mutex<Shared>,
    demux_task: Mutex<Option<AbortHandle>>,
}

impl ClientSession<StreamTransport> {
    /// Connect to `address` by `deadline` (clamped to
    /// [`CONNECT_MAX_DEADLINE`] from now).
    ///
    /// Always returns a session. Resolution, socket, connect, and timeout
    /// failures yield a session whose error message is set; its RPCs all
    /// report that error through `update`.
    pub async fn connect(
        address: ServerAddress,
        max_message_length: u32,
        deadline: Instant,
    ) -> Arc<Self> {
        let Some(sock_addr) = address.resolved() else {
            let message = format!("Failed to resolve {address}");
            return Self::born_dead(address, message);
        };

        let deadline = deadline.min(Instant::now() + CONNECT_MAX_DEADLINE);

        match tokio::time::timeout_at(deadline, TcpStream::connect(sock_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Self::start(StreamTransport::new(stream, max_message_length), address)
            }
            Ok(Err(e)) => {
                let message = format!("Failed to connect socket to {address}: {e}");
                Self::born_dead(address, message)
            }
            Err(_) => {
                let message = format!("Failed to connect socket to {address}: timeout expired");
                Self::born_dead(address, message)
            }
        }
    }
}

impl<T: Transport> ClientSession<T> {
    /// Run a session over an already-established transport.
    pub fn with_transport(transport: T, address: ServerAddress) -> Arc<Self> {
        Self::start(transport, address)
    }

    fn start(transport: T, address: ServerAddress) -> Arc<Self> {
        let transport = Arc::new(transport);
        let session = Arc::new(Self {
            address,
            transport: Some(Arc::clone(&transport)),
            shared: Mutex::new(Shared::new()),
            demux_task: Mutex::new(None),
        });
        // The demux task holds only a weak reference: dropping the last
        // handle ends the session even while the task is blocked in recv.
        let task = tokio::spawn(Self::demux(Arc::downgrade(&session), transport));
        *session.demux_task.lock() = Some(task.abort_handle());
        session
    }

    fn born_dead(address: ServerAddress, error_message: String) -> Arc<Self> {
        Arc::new(Self {
            address,
            transport: None,
            shared: Mutex::new(Shared::born_dead(error_message)),
            demux_task: Mutex::new(None),
        })
    }

    /// The remote endpoint this session was created for.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The session's error message; empty while healthy.
    pub fn error_message(&self) -> String {
        self.shared.lock().error_message.clone()
    }

    /// Number of requests still awaiting a reply (for diagnostics).
    pub fn active_rpcs(&self) -> usize {
        self.shared.lock().num_active_rpcs
    }

    /// Message IDs that still have a slot in the response table, sorted
    /// (for diagnostics).
    pub fn pending_tokens(&self) -> Vec<MessageId> {
        let shared = self.shared.lock();
        let mut ids: Vec<MessageId> = shared.responses.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Submit a request. Never blocks on I/O completion semantics: the
    /// frame is handed to the transport and the returned handle tracks the
    /// reply. Exactly one message ID is allocated per call.
    pub async fn send_request(self: &Arc<Self>, request: Bytes) -> OpaqueRpc<T> {
        let message_id = {
            let mut shared = self.shared.lock();
            let message_id = shared.next_message_id;
            shared.next_message_id += 1;
            shared.responses.insert(message_id, Response::new());

            shared.num_active_rpcs += 1;
            if shared.num_active_rpcs == 1 {
                // active_ping was meaningless while nothing was outstanding.
                shared.active_ping = false;
                self.schedule_timer(&mut shared);
            }
            message_id
        };

        // Send outside the lock so inbound frames can be processed while
        // the send is in flight. A born-dead session has no transport and
        // skips the send; the caller sees the error through update().
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send_frame(Frame::new(message_id, request)).await {
                debug!(
                    message_id,
                    error = %e,
                    "request send failed; the demux task will observe the disconnect"
                );
            }
        }

        OpaqueRpc::new(Arc::clone(self), message_id)
    }

    /// Cancel the RPC with this token. Idempotent, callable from any task,
    /// and never blocks beyond the lock.
    ///
    /// Two ways to cancel: if some task is blocked in `wait`, the slot is
    /// marked `Canceled` and the waiter finishes cleanup; otherwise the
    /// slot is removed here.
    pub fn cancel(&self, token: MessageId) {
        let mut shared = self.shared.lock();
        let Some((status, has_waiter)) = shared
            .responses
            .get(&token)
            .map(|r| (r.status, r.has_waiter))
        else {
            return; // already cancelled or already updated away
        };
        match status {
            // A second cancel while the waiter still owns cleanup.
            ResponseStatus::Canceled => return,
            // The reply won the race and was already accounted against the
            // active count; only the slot goes.
            ResponseStatus::HasReply => {
                shared.responses.remove(&token);
                return;
            }
            ResponseStatus::Waiting => {}
        }

        if has_waiter {
            let response = shared
                .responses
                .get_mut(&token)
                .expect("slot present: checked above");
            response.status = ResponseStatus::Canceled;
            response.ready.notify_waiters();
        } else {
            shared.responses.remove(&token);
        }
        shared.num_active_rpcs -= 1;
        // Not descheduling the timer here: the next fire hits the
        // spurious-wake guard instead.
    }

    /// Wait until the reply for `token` arrives, the RPC is cancelled, the
    /// session fails, or `deadline` passes. Returns without reporting
    /// which; callers follow with [`update`](ClientSession::update).
    pub async fn wait(&self, token: MessageId, deadline: Option<Instant>) {
        loop {
            // `notify` is kept alive for the rest of the loop body so the
            // boxed, pinned future below can borrow it past the end of this
            // block (the lock guard itself must not survive past the
            // block, or the `wait` future would not be `Send`).
            let notify: Arc<Notify>;
            let mut notified = {
                let mut shared = self.shared.lock();

                let Some(status) = shared.responses.get(&token).map(|r| r.status) else {
                    return; // cancelled or already updated away
                };
                match status {
                    ResponseStatus::HasReply => return,
                    ResponseStatus::Canceled => {
                        // The canceller saw our waiter flag and left cleanup
                        // to us.
                        shared.responses.remove(&token);
                        return;
                    }
                    ResponseStatus::Waiting => {}
                }
                if !shared.error_message.is_empty() {
                    return;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return;
                }

                let response = shared
                    .responses
                    .get_mut(&token)
                    .expect("slot present: checked above");
                response.has_waiter = true;
                notify = Arc::clone(&response.ready);
                let mut notified = Box::pin(notify.notified());
                // Register interest before releasing the lock so a signal
                // sent in between cannot be lost.
                notified.as_mut().enable();
                notified
            };

            match deadline {
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, notified.as_mut()).await;
                }
                None => notified.await,
            }

            if let Some(response) = self.shared.lock().responses.get_mut(&token) {
                response.has_waiter = false;
            }
        }
    }

    /// Project the shared slot state onto the caller's handle and remove
    /// the slot if the RPC is finished. Non-blocking; a no-op (leaving the
    /// handle `NotReady`) when the reply is still outstanding on a healthy
    /// session.
    ///
    /// An RPC cancelled through the session-level [`cancel`] is projected
    /// as `Canceled` here even though the handle's own
    /// [`cancel`](OpaqueRpc::cancel) was never called.
    ///
    /// [`cancel`]: ClientSession::cancel
    pub fn update(&self, rpc: &mut OpaqueRpc<T>) {
        let mut shared = self.shared.lock();
        let Some(status) = shared.responses.get(&rpc.response_token).map(|r| r.status) else {
            // The slot is gone: either this handle was already finalized,
            // or the RPC was cancelled through the session-level API (a
            // bare-token cancel, or a raw wait that observed Canceled and
            // erased the slot) without the handle seeing it. Project the
            // cancellation in that case; never clobber a terminal handle.
            if rpc.status == RpcStatus::NotReady {
                rpc.status = RpcStatus::Canceled;
                rpc.error_message = "RPC canceled".to_owned();
                rpc.session = None;
            }
            return;
        };
        if status == ResponseStatus::HasReply {
            let response = shared
                .responses
                .remove(&rpc.response_token)
                .expect("slot present: checked above");
            rpc.reply = response.reply;
            rpc.status = RpcStatus::Ok;
        } else if !shared.error_message.is_empty() {
            rpc.error_message = shared.error_message.clone();
            rpc.status = RpcStatus::Error;
            shared.responses.remove(&rpc.response_token);
        } else if status == ResponseStatus::Canceled {
            // Cancelled through the session-level API with a waiter still
            // parked. The waiter owns the slot's cleanup; the handle can
            // already observe the cancellation.
            rpc.status = RpcStatus::Canceled;
            rpc.error_message = "RPC canceled".to_owned();
        } else {
            return; // not ready
        }
        rpc.session = None;
    }

    /// Schedule the liveness timer for [`TIMEOUT_MS`] from now,
    /// superseding any pending schedule.
    fn schedule_timer(self: &Arc<Self>, shared: &mut Shared) {
        shared.timer_epoch += 1;
        let epoch = shared.timer_epoch;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(TIMEOUT_MS)).await;
            if let Some(session) = weak.upgrade() {
                session.on_timer(epoch).await;
            }
        });
    }

    async fn on_timer(self: Arc<Self>, epoch: u64) {
        let ping = {
            let mut shared = self.shared.lock();
            if epoch != shared.timer_epoch {
                return; // superseded or descheduled
            }
            // Spurious wake-ups: no transport, nothing outstanding, or the
            // session already failed.
            if self.transport.is_none()
                || shared.num_active_rpcs == 0
                || !shared.error_message.is_empty()
            {
                return;
            }

            if !shared.active_ping {
                trace!(address = %self.address, "session is suspicious; sending ping");
                shared.active_ping = true;
                self.schedule_timer(&mut shared);
                true
            } else {
                trace!(address = %self.address, "session timed out");
                let message = format!("Server {} timed out", self.address);
                shared.fail(message);
                false
            }
        };

        if ping {
            let transport = self.transport.as_ref().expect("checked above");
            if let Err(e) = transport.send_frame(Frame::ping()).await {
                debug!(error = %e, "ping send failed; the demux task will observe the disconnect");
            }
        }
    }

    /// The receive loop: the only caller of `recv_frame` for this session.
    async fn demux(session: Weak<Self>, transport: Arc<T>) {
        loop {
            match transport.recv_frame().await {
                Ok(frame) => {
                    let Some(session) = session.upgrade() else {
                        return;
                    };
                    session.on_receive_message(frame);
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "transport error; treating as disconnect");
                    break;
                }
            }
        }
        if let Some(session) = session.upgrade() {
            session.on_disconnect();
        }
    }

    fn on_receive_message(self: &Arc<Self>, frame: Frame) {
        let Frame {
            message_id,
            payload,
        } = frame;
        let mut shared = self.shared.lock();

        if message_id == PING_MESSAGE_ID {
            if shared.num_active_rpcs > 0 && shared.active_ping {
                // The server has shown it is alive for now; get suspicious
                // again in another TIMEOUT_MS.
                shared.active_ping = false;
                self.schedule_timer(&mut shared);
            } else {
                trace!(
                    "unexpected ping response; harmless (e.g. all RPCs completed \
                     before the ping response arrived)"
                );
            }
            return;
        }

        let Some(status) = shared.responses.get(&message_id).map(|r| r.status) else {
            trace!(
                message_id,
                "response with no matching request; dropped (the RPC may have \
                 been cancelled)"
            );
            return;
        };
        match status {
            ResponseStatus::HasReply => {
                warn!(
                    message_id,
                    "second response for one message ID; one side is assigning \
                     IDs incorrectly or the server is misbehaving; dropped"
                );
                return;
            }
            ResponseStatus::Canceled => {
                // The canceller got here first and its waiter owns the
                // slot's cleanup; the reply is ignored.
                trace!(message_id, "response for a cancelled request; dropped");
                return;
            }
            ResponseStatus::Waiting => {}
        }

        // Book-keeping for timeouts: this frame proves liveness.
        shared.num_active_rpcs -= 1;
        if shared.num_active_rpcs == 0 {
            shared.deschedule_timer();
        } else {
            self.schedule_timer(&mut shared);
        }

        let response = shared
            .responses
            .get_mut(&message_id)
            .expect("slot present: checked above");
        response.status = ResponseStatus::HasReply;
        response.reply = payload;
        response.ready.notify_waiters();
    }

    fn on_disconnect(&self) {
        trace!(address = %self.address, "disconnected from server");
        let mut shared = self.shared.lock();
        // A disconnect commonly follows a liveness timeout; the first
        // failure wins.
        if shared.error_message.is_empty() {
            shared.fail(format!("Disconnected from server {}", self.address));
        }
    }
}

impl<T: Transport> fmt::Display for ClientSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = self.error_message();
        if error.is_empty() {
            write!(f, "Active session to {}", self.address)
        } else {
            // The error already names the server.
            write!(f, "Closed session: {error}")
        }
    }
}

impl<T: Transport> Drop for ClientSession<T> {
    fn drop(&mut self) {
        if let Some(task) = self.demux_task.get_mut().take() {
            task.abort();
        }
        if let Some(transport) = &self.transport {
            transport.close();
        }
        self.shared.get_mut().deschedule_timer();
    }
}
