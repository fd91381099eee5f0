//! The reconnecting WebSocket client.
//!
//! One long-lived duplex connection per logical session. The client
//! drives the upgrade with the identity token and optional group as
//! query parameters, waits (bounded) for the server handshake, answers
//! `system.ping` with `system.pong`, and — after an abnormal close —
//! lets the [`ReconnectController`] schedule exactly one reconnect
//! attempt per backoff delay, sending a resume request before normal
//! traffic continues.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::backoff::ReconnectConfig;
use parley_core::close;
use parley_core::envelope::Envelope;
use parley_core::ids::ConnectionId;
use parley_core::protocol;

use crate::reconnect::{Decision, ReconnectController};
use crate::state::{ClientState, ClientStateMachine};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9600/ws`.
    pub url: String,
    /// Identity token passed on the upgrade request.
    pub token: String,
    /// Optional group to join at accept time.
    pub group: Option<String>,
    /// Reconnection parameters.
    pub reconnect: ReconnectConfig,
    /// Bound on the handshake and resume exchanges, in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl ClientConfig {
    /// Config with default reconnect parameters.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            group: None,
            reconnect: ReconnectConfig::default(),
            handshake_timeout_ms: 10_000,
        }
    }

    /// Join a group at accept time.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum ClientEvent {
    /// A connection is live and ready for traffic.
    Connected {
        /// Server-assigned connection id.
        connection_id: ConnectionId,
        /// Whether a prior session was resumed.
        resumed: bool,
    },
    /// An inbound envelope (everything except pings).
    Envelope(Envelope),
    /// An abnormal close was observed; an attempt is scheduled.
    Reconnecting {
        /// Zero-based attempt index.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// A terminal close code ended the session.
    Closed {
        /// The close code observed.
        code: u16,
    },
    /// Reconnect attempts are exhausted. Terminal and user-visible.
    GaveUp,
}

/// How one live session ended.
enum SessionEnd {
    Closed(u16),
    Cancelled,
    ConsumerGone,
}

/// The client: owns the state machine and reconnection controller and
/// drives connections until a terminal outcome.
pub struct ParleyClient {
    config: ClientConfig,
    state: ClientStateMachine,
    controller: ReconnectController,
}

impl ParleyClient {
    /// Create a client.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let controller = ReconnectController::new(config.reconnect.clone());
        Self {
            config,
            state: ClientStateMachine::new(),
            controller,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state.current()
    }

    fn endpoint(&self) -> String {
        match &self.config.group {
            Some(group) => format!(
                "{}?token={}&group={}",
                self.config.url, self.config.token, group
            ),
            None => format!("{}?token={}", self.config.url, self.config.token),
        }
    }

    /// Run until cancelled or a terminal outcome.
    ///
    /// `outbound` carries application envelopes to send; `events`
    /// surfaces connection lifecycle and inbound traffic.
    pub async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Envelope>,
        events: mpsc::Sender<ClientEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let _ = self.state.transition(ClientState::Connecting);
            let decision = match connect_async(self.endpoint()).await {
                Ok((ws, _response)) => {
                    let _ = self.state.transition(ClientState::Connected);
                    match self
                        .drive_session(ws, &mut outbound, &events, &cancel)
                        .await
                    {
                        SessionEnd::Cancelled => {
                            let _ = self.state.transition(ClientState::Closed);
                            return;
                        }
                        SessionEnd::ConsumerGone => return,
                        SessionEnd::Closed(code) => {
                            let _ = self.state.transition(ClientState::Reconnecting);
                            let decision = self.controller.handle_close(code);
                            if matches!(decision, Decision::Stop) {
                                let _ = self.state.transition(ClientState::Closed);
                                let _ = events.send(ClientEvent::Closed { code }).await;
                                return;
                            }
                            decision
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, "dial failed");
                    let _ = self.state.transition(ClientState::Reconnecting);
                    self.controller.handle_connect_failure()
                }
            };

            match decision {
                Decision::Reconnect { delay, attempt } => {
                    if events
                        .send(ClientEvent::Reconnecting { attempt, delay })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            let _ = self.state.transition(ClientState::Closed);
                            return;
                        }
                    }
                }
                Decision::GiveUp => {
                    let _ = self.state.transition(ClientState::Closed);
                    warn!(
                        attempts = self.controller.attempt_count(),
                        "giving up on reconnection"
                    );
                    let _ = events.send(ClientEvent::GaveUp).await;
                    return;
                }
                Decision::Stop | Decision::StopSilent => {
                    let _ = self.state.transition(ClientState::Closed);
                    return;
                }
            }
        }
    }

    /// Drive one live socket: handshake, optional resume, then traffic.
    async fn drive_session(
        &mut self,
        ws: WsStream,
        outbound: &mut mpsc::Receiver<Envelope>,
        events: &mpsc::Sender<ClientEvent>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let exchange_timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        // Handshake, bounded.
        let established = match tokio::time::timeout(
            exchange_timeout,
            wait_for_kind(&mut ws_rx, protocol::CONNECTION_ESTABLISHED),
        )
        .await
        {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(code)) => return SessionEnd::Closed(code),
            Err(_elapsed) => {
                warn!("handshake timed out");
                return SessionEnd::Closed(close::ABNORMAL);
            }
        };
        let Some(connection_id) = established
            .payload
            .get("connectionId")
            .and_then(Value::as_str)
            .map(ConnectionId::from)
        else {
            warn!("handshake missing connectionId");
            return SessionEnd::Closed(close::PROTOCOL_VIOLATION);
        };
        info!(conn_id = %connection_id, "connection established");
        self.controller.on_established(connection_id.clone());

        // Resume before normal traffic, when a prior session is held.
        let mut resumed = false;
        if let Some(request) = self.controller.resume_request() {
            if send_envelope(&mut ws_tx, &request).await.is_err() {
                return SessionEnd::Closed(close::ABNORMAL);
            }
            match tokio::time::timeout(
                exchange_timeout,
                wait_for_kind(&mut ws_rx, protocol::CONNECTION_RESUMED),
            )
            .await
            {
                Ok(Ok(reply)) => {
                    if reply.payload.get("stateValid").and_then(Value::as_bool) == Some(true) {
                        self.controller.on_resume_acknowledged();
                        resumed = true;
                    } else {
                        debug!("resume rejected by server");
                        self.controller.on_resume_rejected();
                    }
                }
                Ok(Err(code)) => return SessionEnd::Closed(code),
                Err(_elapsed) => {
                    warn!("resume exchange timed out");
                    self.controller.on_resume_rejected();
                }
            }
        }

        let _ = self.state.transition(ClientState::Active);
        if events
            .send(ClientEvent::Connected {
                connection_id,
                resumed,
            })
            .await
            .is_err()
        {
            return SessionEnd::ConsumerGone;
        }

        let mut outbound_done = false;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutdown".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    return SessionEnd::Cancelled;
                }
                sendable = outbound.recv(), if !outbound_done => {
                    match sendable {
                        Some(envelope) => {
                            if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                                return SessionEnd::Closed(close::ABNORMAL);
                            }
                        }
                        None => outbound_done = true,
                    }
                }
                frame = ws_rx.next() => {
                    match frame {
                        None => return SessionEnd::Closed(close::ABNORMAL),
                        Some(Err(err)) => {
                            debug!(%err, "transport error");
                            return SessionEnd::Closed(close::ABNORMAL);
                        }
                        Some(Ok(Message::Text(text))) => {
                            match Envelope::decode(&text) {
                                Ok(envelope) => {
                                    if let Some(end) =
                                        self.handle_envelope(envelope, &mut ws_tx, events).await
                                    {
                                        return end;
                                    }
                                }
                                Err(err) => debug!(%err, "undecodable server frame"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map_or(close::ABNORMAL, |f| u16::from(f.code));
                            info!(code, "server closed connection");
                            return SessionEnd::Closed(code);
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Process one inbound envelope. Pings are answered in place;
    /// everything else goes to the events channel.
    async fn handle_envelope(
        &mut self,
        envelope: Envelope,
        ws_tx: &mut WsSink,
        events: &mpsc::Sender<ClientEvent>,
    ) -> Option<SessionEnd> {
        if let Some(seq) = envelope.sequence {
            self.controller.record_sequence(seq);
        }
        if envelope.kind() == protocol::SYSTEM_PING {
            let pong = Envelope::client(
                protocol::SYSTEM_PONG,
                json!({
                    "sentAt": envelope.payload.get("sentAt").cloned().unwrap_or(Value::Null)
                }),
            );
            if send_envelope(ws_tx, &pong).await.is_err() {
                return Some(SessionEnd::Closed(close::ABNORMAL));
            }
            return None;
        }
        if events.send(ClientEvent::Envelope(envelope)).await.is_err() {
            return Some(SessionEnd::ConsumerGone);
        }
        None
    }
}

/// Read frames until an envelope of `kind` arrives. Other envelopes
/// received during an exchange are dropped; a close or transport error
/// yields the close code.
async fn wait_for_kind(ws_rx: &mut WsSource, kind: &str) -> Result<Envelope, u16> {
    loop {
        match ws_rx.next().await {
            None => return Err(close::ABNORMAL),
            Some(Err(_)) => return Err(close::ABNORMAL),
            Some(Ok(Message::Text(text))) => {
                if let Ok(envelope) = Envelope::decode(&text) {
                    if envelope.kind() == kind {
                        return Ok(envelope);
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(frame.map_or(close::ABNORMAL, |f| u16::from(f.code)));
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn send_envelope(
    ws_tx: &mut WsSink,
    envelope: &Envelope,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match envelope.encode() {
        Ok(frame) => ws_tx.send(Message::Text(frame.into())).await,
        Err(err) => {
            // Unsendable envelope; skipping it beats tearing the session.
            debug!(%err, "envelope encode failed");
            Ok(())
        }
    }
}
