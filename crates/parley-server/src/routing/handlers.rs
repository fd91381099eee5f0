//! Built-in system handlers and the domain hand-off seam.
//!
//! The domain dispatch boundary is [`DomainSink`]: handlers that need
//! business logic submit the payload and return promptly; long-running
//! work happens on the other side of the channel, never on the receive
//! loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use parley_core::envelope::Envelope;
use parley_core::errors::{self, ProtocolError};
use parley_core::ids::{ConnectionId, GroupId, Identity};
use parley_core::protocol;

use crate::routing::router::{MessageHandler, MessageRouter, RouterContext};
use crate::ws::connection::Connection;
use crate::ws::state::ConnectionState;

// ── Domain sink ─────────────────────────────────────────────────────

/// Asynchronous hand-off into domain processing. Opaque to this core:
/// the only capability handlers need is "submit this payload".
#[async_trait]
pub trait DomainSink: Send + Sync {
    /// Submit a payload for asynchronous domain processing.
    async fn submit(&self, identity: &Identity, envelope: Envelope) -> Result<(), ProtocolError>;
}

/// Sink that accepts and discards everything. For tests and for servers
/// with no domain plane wired up.
pub struct NullDomainSink;

#[async_trait]
impl DomainSink for NullDomainSink {
    async fn submit(&self, _identity: &Identity, _envelope: Envelope) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// One submitted domain message.
#[derive(Debug)]
pub struct DomainSubmission {
    /// Who sent it.
    pub identity: Identity,
    /// What they sent.
    pub envelope: Envelope,
}

/// Sink backed by a bounded channel; the consumer side is the actual
/// domain dispatcher. `submit` never blocks: a full queue is reported
/// as a server error rather than stalling the receive loop.
pub struct ChannelDomainSink {
    tx: mpsc::Sender<DomainSubmission>,
}

impl ChannelDomainSink {
    /// Create the sink and its consumer end.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DomainSubmission>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DomainSink for ChannelDomainSink {
    async fn submit(&self, identity: &Identity, envelope: Envelope) -> Result<(), ProtocolError> {
        self.tx
            .try_send(DomainSubmission {
                identity: identity.clone(),
                envelope,
            })
            .map_err(|_| ProtocolError::Internal {
                message: "domain queue unavailable".into(),
            })
    }
}

// ── System handlers ─────────────────────────────────────────────────

/// `system.pong`: the client answered a ping. Activity accounting is the
/// whole job; the stale sweep reads the clock this refreshes.
pub struct PongHandler;

#[async_trait]
impl MessageHandler for PongHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        _ctx: &RouterContext,
    ) -> Result<(), ProtocolError> {
        conn.touch();
        debug!(conn_id = %conn.id, sent_at = ?envelope.payload.get("sentAt"), "pong received");
        Ok(())
    }
}

/// `control.flow.start`: the client is about to begin normal traffic.
/// Binds the group (from the payload or the envelope) and promotes the
/// connection to `Active`.
pub struct FlowStartHandler;

#[async_trait]
impl MessageHandler for FlowStartHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        ctx: &RouterContext,
    ) -> Result<(), ProtocolError> {
        let group = envelope
            .payload
            .get("groupId")
            .and_then(Value::as_str)
            .map(GroupId::from)
            .or_else(|| envelope.group_id.clone());
        if let Some(group) = group {
            ctx.registry.bind_group(conn, group).await;
        }
        if conn.can_transition(ConnectionState::Active) {
            let _ = conn.transition(ConnectionState::Active);
        }
        Ok(())
    }
}

/// `system.connection.resume`: reclaim continuity with a prior, now-dead
/// connection. Replies `system.connection.resumed` either way; state is
/// validated, not replayed (there is no durable message log).
pub struct ResumeHandler;

#[async_trait]
impl MessageHandler for ResumeHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        ctx: &RouterContext,
    ) -> Result<(), ProtocolError> {
        let previous = envelope
            .payload
            .get("previousConnectionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Validation {
                code: errors::RESUME_REJECTED.into(),
                message: "missing previousConnectionId".into(),
            })?;

        let outcome = ctx
            .registry
            .resume(&ConnectionId::from(previous), conn)
            .await;

        if outcome.state_valid && conn.can_transition(ConnectionState::Active) {
            let _ = conn.transition(ConnectionState::Active);
        }

        let reply = Envelope::server(
            protocol::CONNECTION_RESUMED,
            json!({
                "stateValid": outcome.state_valid,
                "replayedCount": 0,
                "groupId": outcome.group,
                "lastSequence": outcome.last_seq,
            }),
        );
        if let Err(err) = conn.send(reply) {
            debug!(conn_id = %conn.id, %err, "could not deliver resume reply");
        }
        Ok(())
    }
}

/// Forwards an envelope into the domain sink. Register it for each
/// domain-plane kind the deployment understands.
pub struct DomainForwardHandler;

#[async_trait]
impl MessageHandler for DomainForwardHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        ctx: &RouterContext,
    ) -> Result<(), ProtocolError> {
        ctx.domain.submit(&conn.identity, envelope).await
    }
}

/// Register the built-in system handlers.
pub fn register_defaults(router: &mut MessageRouter) {
    router.register(protocol::SYSTEM_PONG, PongHandler);
    router.register(protocol::CONNECTION_RESUME, ResumeHandler);
    router.register(protocol::CONTROL_FLOW_START, FlowStartHandler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ws::registry::ConnectionRegistry;
    use std::time::Duration;

    fn make_ctx() -> RouterContext {
        RouterContext {
            registry: Arc::new(ConnectionRegistry::new(ServerConfig::default())),
            domain: Arc::new(NullDomainSink),
        }
    }

    async fn accepted_conn(
        ctx: &RouterContext,
        identity: &str,
        group: Option<&str>,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (tx, mut rx) = mpsc::channel(32);
        let conn = ctx
            .registry
            .accept(Identity::from(identity), group.map(GroupId::from), tx)
            .await
            .unwrap();
        // Drain the handshake.
        let _ = rx.try_recv();
        conn.transition(ConnectionState::Authenticated).unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn register_defaults_covers_system_kinds() {
        let mut router = MessageRouter::new();
        register_defaults(&mut router);
        assert!(router.has_handler(protocol::SYSTEM_PONG));
        assert!(router.has_handler(protocol::CONNECTION_RESUME));
        assert!(router.has_handler(protocol::CONTROL_FLOW_START));
    }

    #[tokio::test]
    async fn pong_refreshes_activity() {
        let ctx = make_ctx();
        let (conn, _rx) = accepted_conn(&ctx, "alice", None).await;
        std::thread::sleep(Duration::from_millis(10));
        let idle_before = conn.idle_for();

        PongHandler
            .handle(
                &conn,
                Envelope::client(protocol::SYSTEM_PONG, json!({"sentAt": "t"})),
                &ctx,
            )
            .await
            .unwrap();

        assert!(conn.idle_for() < idle_before);
    }

    #[tokio::test]
    async fn flow_start_binds_group_and_activates() {
        let ctx = make_ctx();
        let (conn, _rx) = accepted_conn(&ctx, "alice", None).await;

        FlowStartHandler
            .handle(
                &conn,
                Envelope::client(protocol::CONTROL_FLOW_START, json!({"groupId": "g7"})),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(conn.group().unwrap().as_str(), "g7");
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(ctx.registry.group_size(&GroupId::from("g7")).await, 1);
    }

    #[tokio::test]
    async fn flow_start_without_group_still_activates() {
        let ctx = make_ctx();
        let (conn, _rx) = accepted_conn(&ctx, "alice", None).await;

        FlowStartHandler
            .handle(
                &conn,
                Envelope::client(protocol::CONTROL_FLOW_START, json!({})),
                &ctx,
            )
            .await
            .unwrap();

        assert!(conn.group().is_none());
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn resume_replies_resumed_with_state() {
        let ctx = make_ctx();
        let (old, _old_rx) = accepted_conn(&ctx, "alice", Some("g1")).await;
        let old_id = old.id.clone();
        ctx.registry.remove(&old_id).await;

        let (conn, mut rx) = accepted_conn(&ctx, "alice", None).await;
        ResumeHandler
            .handle(
                &conn,
                Envelope::client(
                    protocol::CONNECTION_RESUME,
                    json!({"previousConnectionId": old_id.as_str()}),
                ),
                &ctx,
            )
            .await
            .unwrap();

        let frame = rx.try_recv().unwrap();
        let reply = Envelope::decode(&frame).unwrap();
        assert_eq!(reply.kind(), protocol::CONNECTION_RESUMED);
        assert_eq!(reply.payload["stateValid"], true);
        assert_eq!(reply.payload["replayedCount"], 0);
        assert_eq!(reply.payload["groupId"], "g1");
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn resume_unknown_connection_reports_invalid() {
        let ctx = make_ctx();
        let (conn, mut rx) = accepted_conn(&ctx, "alice", None).await;

        ResumeHandler
            .handle(
                &conn,
                Envelope::client(
                    protocol::CONNECTION_RESUME,
                    json!({"previousConnectionId": "ghost"}),
                ),
                &ctx,
            )
            .await
            .unwrap();

        let frame = rx.try_recv().unwrap();
        let reply = Envelope::decode(&frame).unwrap();
        assert_eq!(reply.payload["stateValid"], false);
    }

    #[tokio::test]
    async fn resume_without_previous_id_is_validation_error() {
        let ctx = make_ctx();
        let (conn, _rx) = accepted_conn(&ctx, "alice", None).await;

        let err = ResumeHandler
            .handle(
                &conn,
                Envelope::client(protocol::CONNECTION_RESUME, json!({})),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::RESUME_REJECTED);
    }

    #[tokio::test]
    async fn channel_sink_delivers_submission() {
        let (sink, mut rx) = ChannelDomainSink::new(8);
        let envelope = Envelope::client("chat.message.send", json!({"text": "hi"}));
        sink.submit(&Identity::from("alice"), envelope).await.unwrap();

        let submission = rx.recv().await.unwrap();
        assert_eq!(submission.identity.as_str(), "alice");
        assert_eq!(submission.envelope.kind(), "chat.message.send");
    }

    #[tokio::test]
    async fn channel_sink_full_queue_errors_promptly() {
        let (sink, _rx) = ChannelDomainSink::new(1);
        let identity = Identity::from("alice");
        sink.submit(&identity, Envelope::client("a.b.c", json!({})))
            .await
            .unwrap();
        let err = sink
            .submit(&identity, Envelope::client("a.b.c", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn forward_handler_submits_to_sink() {
        let (sink, mut rx) = ChannelDomainSink::new(8);
        let ctx = RouterContext {
            registry: Arc::new(ConnectionRegistry::new(ServerConfig::default())),
            domain: Arc::new(sink),
        };
        let (conn, _conn_rx) = accepted_conn(&ctx, "alice", None).await;

        DomainForwardHandler
            .handle(
                &conn,
                Envelope::client("chat.message.send", json!({"text": "hello"})),
                &ctx,
            )
            .await
            .unwrap();

        let submission = rx.recv().await.unwrap();
        assert_eq!(submission.envelope.payload["text"], "hello");
    }
}
