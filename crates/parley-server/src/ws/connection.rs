//! The live connection object wrapping one transport socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use parley_core::envelope::Envelope;
use parley_core::ids::{ConnectionId, GroupId, Identity};

use super::state::{ConnectionState, StateMachine};

/// Why a connection was closed, recorded once by the first `close` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// Close code (see `parley_core::close`).
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// Failure to enqueue an outbound envelope.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The underlying transport is not in an open state.
    #[error("connection is not open")]
    NotConnected,
    /// The bounded send queue rejected the message.
    #[error("outbound queue full")]
    QueueFull,
    /// The envelope could not be serialized.
    #[error("encode failed: {0}")]
    Codec(#[from] parley_core::envelope::CodecError),
}

/// One live transport session.
///
/// Exclusively owned by the registry that created it; other components
/// mutate it only through registry-mediated calls. The receive loop and
/// the background tasks share it behind an `Arc`.
pub struct Connection {
    /// Unique id assigned at accept time.
    pub id: ConnectionId,
    /// Authenticated principal, immutable for the connection's life.
    pub identity: Identity,
    group: Mutex<Option<GroupId>>,
    state: Mutex<StateMachine>,
    /// When the transport handshake completed.
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    outbound_seq: AtomicU64,
    tx: mpsc::Sender<Arc<String>>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    /// Messages dropped because the send queue was full.
    pub dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a new connection in the `Connecting` state.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        group: Option<GroupId>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            group: Mutex::new(group),
            state: Mutex::new(StateMachine::new()),
            created_at: now,
            last_activity: Mutex::new(now),
            outbound_seq: AtomicU64::new(0),
            tx,
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.lock().current()
    }

    /// Attempt a state transition; an invalid transition is logged and
    /// returned, never silently swallowed.
    pub fn transition(
        &self,
        to: ConnectionState,
    ) -> Result<(), super::state::InvalidTransition> {
        let result = self.state.lock().transition(to);
        if let Err(ref err) = result {
            warn!(conn_id = %self.id, %err, "rejected state transition");
        }
        result
    }

    /// Pure transition check.
    #[must_use]
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        self.state.lock().can_transition(to)
    }

    /// Whether the connection has reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    /// Bind (or rebind) the session group.
    pub fn bind_group(&self, group: GroupId) {
        *self.group.lock() = Some(group);
    }

    /// Current group binding.
    #[must_use]
    pub fn group(&self) -> Option<GroupId> {
        self.group.lock().clone()
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// The last stamped outbound sequence number.
    #[must_use]
    pub fn outbound_seq(&self) -> u64 {
        self.outbound_seq.load(Ordering::Relaxed)
    }

    /// Enqueue an envelope for the outbound writer.
    ///
    /// Never blocks: the queue is bounded and rejects when full (the
    /// per-write transport timeout lives in the writer task). On success
    /// the envelope carries the next monotonic outbound sequence number,
    /// which is returned.
    pub fn send(&self, mut envelope: Envelope) -> Result<u64, SendError> {
        if self.is_closed() || self.cancel.is_cancelled() {
            return Err(SendError::NotConnected);
        }
        let seq = self.outbound_seq.fetch_add(1, Ordering::Relaxed) + 1;
        envelope.sequence = Some(seq);
        let frame = envelope.encode()?;
        match self.tx.try_send(Arc::new(frame)) {
            Ok(()) => Ok(seq),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::NotConnected),
        }
    }

    /// Initiate close. Idempotent: the first call records the reason,
    /// drives the state machine to `Closed`, and cancels the receive
    /// loop; later calls are no-ops.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(CloseReason {
                code,
                reason: reason.into(),
            });
        }
        {
            let mut state = self.state.lock();
            if state.can_transition(ConnectionState::Closing) {
                let _ = state.transition(ConnectionState::Closing);
            }
            if state.can_transition(ConnectionState::Closed) {
                let _ = state.transition(ConnectionState::Closed);
            }
        }
        self.cancel.cancel();
    }

    /// The recorded close reason, if `close` has been called.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Resolves when `close` has been called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Total messages dropped for this connection.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::protocol;
    use serde_json::json;

    fn make_connection() -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Connection::new(
            ConnectionId::from("c1"),
            Identity::from("alice"),
            None,
            tx,
        );
        (Arc::new(conn), rx)
    }

    fn open(conn: &Connection) {
        conn.transition(ConnectionState::Connected).unwrap();
        conn.transition(ConnectionState::Authenticated).unwrap();
        conn.transition(ConnectionState::Active).unwrap();
    }

    #[test]
    fn new_connection_is_connecting() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.is_closed());
        assert!(conn.group().is_none());
    }

    #[tokio::test]
    async fn send_stamps_monotonic_sequence() {
        let (conn, mut rx) = make_connection();
        open(&conn);
        let s1 = conn
            .send(Envelope::server(protocol::SYSTEM_PING, json!({})))
            .unwrap();
        let s2 = conn
            .send(Envelope::server(protocol::SYSTEM_PING, json!({})))
            .unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(conn.outbound_seq(), 2);

        let frame = rx.recv().await.unwrap();
        let env = Envelope::decode(&frame).unwrap();
        assert_eq!(env.sequence, Some(1));
    }

    #[test]
    fn send_after_close_fails_not_connected() {
        let (conn, _rx) = make_connection();
        open(&conn);
        conn.close(1000, "done");
        let err = conn
            .send(Envelope::server(protocol::SYSTEM_PING, json!({})))
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[test]
    fn send_to_full_queue_fails_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), Identity::from("a"), None, tx);
        open(&conn);
        conn.send(Envelope::server(protocol::SYSTEM_PING, json!({})))
            .unwrap();
        let err = conn
            .send(Envelope::server(protocol::SYSTEM_PING, json!({})))
            .unwrap_err();
        assert!(matches!(err, SendError::QueueFull));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_to_dropped_receiver_fails() {
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), Identity::from("a"), None, tx);
        open(&conn);
        drop(rx);
        let err = conn
            .send(Envelope::server(protocol::SYSTEM_PING, json!({})))
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _rx) = make_connection();
        open(&conn);
        conn.close(4202, "idle timeout");
        conn.close(1000, "second call ignored");
        let reason = conn.close_reason().unwrap();
        assert_eq!(reason.code, 4202);
        assert_eq!(reason.reason, "idle timeout");
        assert!(conn.is_closed());
        assert!(conn.is_cancelled());
    }

    #[test]
    fn close_from_connecting_goes_direct_to_closed() {
        let (conn, _rx) = make_connection();
        conn.close(4001, "auth failed");
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_close() {
        let (conn, _rx) = make_connection();
        open(&conn);
        let waiter = conn.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        conn.close(1012, "going away");
        assert!(handle.await.unwrap());
    }

    #[test]
    fn touch_resets_idle_clock() {
        let (conn, _rx) = make_connection();
        std::thread::sleep(Duration::from_millis(10));
        assert!(conn.idle_for() >= Duration::from_millis(10));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_millis(10));
    }

    #[test]
    fn bind_group_and_rebind() {
        let (conn, _rx) = make_connection();
        conn.bind_group(GroupId::from("g1"));
        assert_eq!(conn.group().unwrap().as_str(), "g1");
        conn.bind_group(GroupId::from("g2"));
        assert_eq!(conn.group().unwrap().as_str(), "g2");
    }

    #[test]
    fn invalid_transition_is_reported() {
        let (conn, _rx) = make_connection();
        let err = conn.transition(ConnectionState::Active).unwrap_err();
        assert_eq!(err.from, ConnectionState::Connecting);
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }
}
