//! Per-connection session: owns the socket from upgrade to disconnect.
//!
//! One receive loop per connection. Each envelope is fully routed —
//! middleware chain included — before the next frame is read, so
//! messages from a single connection are processed in arrival order.
//! Decode failures produce a `system.error` response and the loop
//! continues; transport failures end the loop and trigger registry
//! cleanup (the server never retries — reconnection is the client's
//! job).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use parley_core::close;
use parley_core::envelope::Envelope;
use parley_core::ids::{GroupId, Identity};

use crate::config::ServerConfig;
use crate::routing::router::{MessageRouter, RouterContext};
use crate::ws::connection::Connection;
use crate::ws::registry::{AcceptError, ConnectionRegistry};
use crate::ws::state::ConnectionState;

/// How long cleanup waits for the outbound writer to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a session for one upgraded socket.
///
/// 1. Registers the connection (handshake queued before accept returns)
/// 2. Spawns the outbound writer with a bounded per-write timeout
/// 3. Routes each inbound frame, one at a time, in order
/// 4. Cleans up: closes, drains the writer, removes from the registry
#[instrument(skip_all, fields(identity = %identity))]
pub async fn run_session(
    socket: WebSocket,
    identity: Identity,
    group: Option<GroupId>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    ctx: Arc<RouterContext>,
    config: ServerConfig,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(config.max_send_queue);

    let conn = match registry.accept(identity, group, send_tx).await {
        Ok(conn) => conn,
        Err(err @ AcceptError::AtCapacity { .. }) => {
            warn!(%err, "rejecting connection");
            let frame = CloseFrame {
                code: close::TRY_AGAIN_LATER,
                reason: "server at capacity".into(),
            };
            let _ = ws_tx.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let connected_at = std::time::Instant::now();
    gauge!("ws_sessions_active").increment(1.0);

    // Identity was verified before the upgrade, so the machine moves
    // straight through Authenticated once the handshake is queued.
    if let Err(err) = conn.transition(ConnectionState::Authenticated) {
        warn!(conn_id = %conn.id, %err, "could not authenticate fresh connection");
    }

    let writer = tokio::spawn(run_writer(
        ws_tx,
        send_rx,
        Arc::clone(&conn),
        Duration::from_millis(config.write_timeout_ms),
    ));

    // One envelope is routed to completion before the next frame is
    // read; ordering within a connection is the loop structure itself.
    loop {
        tokio::select! {
            () = conn.cancelled() => {
                debug!(conn_id = %conn.id, "receive loop cancelled");
                break;
            }
            frame = ws_rx.next() => {
                let Some(frame) = frame else { break };
                let message = match frame {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(conn_id = %conn.id, %err, "transport error");
                        break;
                    }
                };
                if !handle_frame(&conn, message, &router, &ctx).await {
                    break;
                }
            }
        }
    }

    info!(conn_id = %conn.id, "session ended");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_sessions_active").decrement(1.0);
    histogram!("ws_session_duration_seconds").record(connected_at.elapsed().as_secs_f64());

    // No-op when a close reason was already recorded (eviction,
    // shutdown, duplicate session).
    conn.close(close::ABNORMAL, "transport closed");
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(conn_id = %conn.id, "outbound writer did not drain in time");
    }
    registry.remove(&conn.id).await;
}

/// Process one frame. Returns `false` when the session should end.
async fn handle_frame(
    conn: &Arc<Connection>,
    message: Message,
    router: &MessageRouter,
    ctx: &RouterContext,
) -> bool {
    let text = match message {
        Message::Text(ref text) => Some(text.to_string()),
        Message::Binary(ref data) => match std::str::from_utf8(data) {
            Ok(text) => Some(text.to_string()),
            Err(_) => {
                debug!(conn_id = %conn.id, len = data.len(), "ignoring non-UTF8 binary frame");
                None
            }
        },
        Message::Ping(_) | Message::Pong(_) => {
            conn.touch();
            None
        }
        Message::Close(_) => {
            info!(conn_id = %conn.id, "client sent close frame");
            return false;
        }
    };

    let Some(text) = text else { return true };
    conn.touch();

    match Envelope::decode(&text) {
        Ok(envelope) => router.route(conn, envelope, ctx).await,
        Err(err) => {
            // Recoverable: report and keep the connection open.
            warn!(conn_id = %conn.id, %err, "frame decode failed");
            counter!("ws_decode_failures_total").increment(1);
            let error = parley_core::errors::ProtocolError::decode(err.to_string());
            if let Err(send_err) = conn.send(error.to_envelope()) {
                debug!(conn_id = %conn.id, %send_err, "could not deliver decode error");
            }
        }
    }
    true
}

/// Drain the outbound channel into the socket, bounding every write.
/// On cancellation, sends the recorded close frame (unless the session
/// ended abnormally with no frame to send).
async fn run_writer(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    conn: Arc<Connection>,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            message = send_rx.recv() => {
                let Some(text) = message else { break };
                let write = ws_tx.send(Message::Text(text.as_str().into()));
                match tokio::time::timeout(write_timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(conn_id = %conn.id, %err, "outbound write failed");
                        return;
                    }
                    Err(_elapsed) => {
                        warn!(conn_id = %conn.id, "outbound write timed out");
                        return;
                    }
                }
            }
            () = conn.cancelled() => break,
        }
    }

    if let Some(reason) = conn.close_reason() {
        if reason.code != close::ABNORMAL {
            let frame = CloseFrame {
                code: reason.code,
                reason: reason.reason.into(),
            };
            let _ = tokio::time::timeout(
                write_timeout,
                ws_tx.send(Message::Close(Some(frame))),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    // Session behavior requires real WebSocket connections and is
    // covered end-to-end in tests/integration.rs. The unit tests here
    // pin the pieces that do not need a socket.

    use super::*;
    use parley_core::protocol;
    use serde_json::json;

    #[test]
    fn writer_drain_timeout_is_bounded() {
        assert!(WRITER_DRAIN_TIMEOUT <= Duration::from_secs(5));
    }

    #[test]
    fn decode_error_envelope_is_recoverable() {
        let error = parley_core::errors::ProtocolError::decode("bad frame");
        let envelope = error.to_envelope();
        assert_eq!(envelope.kind(), protocol::SYSTEM_ERROR);
        assert_eq!(envelope.payload["recoverable"], json!(true));
        assert_eq!(envelope.payload["category"], "validation");
    }
}
