//! The reconnection controller.
//!
//! Decides what to do after every disconnect: terminal close codes
//! stop the client, recoverable ones schedule exactly one reconnect
//! attempt after a jittered exponential backoff delay. The attempt
//! counter resets to zero only once the server acknowledges a resume
//! (or after a fresh handshake when there is nothing to resume) — a
//! reconnect that dies before that point keeps escalating the backoff.

use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tracing::debug;

use parley_core::backoff::{ReconnectConfig, backoff_delay_with_random};
use parley_core::close::{ClosePolicy, policy_for};
use parley_core::envelope::Envelope;
use parley_core::ids::ConnectionId;
use parley_core::protocol;

/// What the client should do after a disconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Schedule a single reconnect attempt after `delay`.
    Reconnect {
        /// Jittered backoff delay.
        delay: Duration,
        /// Zero-based attempt index this delay was computed for.
        attempt: u32,
    },
    /// Consecutive failures exhausted `max_attempts`: terminal,
    /// user-visible.
    GiveUp,
    /// Terminal close code: stop and surface the failure.
    Stop,
    /// Duplicate session: stop without a user-facing error.
    StopSilent,
}

/// Tracks reconnection state across the lifetime of a logical session.
#[derive(Debug)]
pub struct ReconnectController {
    config: ReconnectConfig,
    attempt_count: u32,
    last_connection_id: Option<ConnectionId>,
    pending_resume: Option<ConnectionId>,
    last_acked_seq: u64,
}

impl ReconnectController {
    /// Create a controller.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
            last_connection_id: None,
            pending_resume: None,
            last_acked_seq: 0,
        }
    }

    /// Consecutive failed attempts so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Highest server sequence number observed.
    #[must_use]
    pub fn last_acked_seq(&self) -> u64 {
        self.last_acked_seq
    }

    /// The connection id a resume request would reference.
    #[must_use]
    pub fn resume_target(&self) -> Option<&ConnectionId> {
        self.pending_resume.as_ref()
    }

    /// Record an observed server sequence number.
    pub fn record_sequence(&mut self, seq: u64) {
        self.last_acked_seq = self.last_acked_seq.max(seq);
    }

    /// A handshake arrived. When a prior connection id is held it
    /// becomes the resume target and the attempt counter stays put
    /// until the resume is acknowledged; a fresh handshake (nothing to
    /// resume) resets the counter immediately.
    pub fn on_established(&mut self, id: ConnectionId) {
        self.pending_resume = self.last_connection_id.take();
        self.last_connection_id = Some(id);
        if self.pending_resume.is_none() {
            self.attempt_count = 0;
        }
    }

    /// The server acknowledged the resume: continuity restored.
    pub fn on_resume_acknowledged(&mut self) {
        self.pending_resume = None;
        self.attempt_count = 0;
    }

    /// The server rejected the resume; the fresh handshake stands on
    /// its own.
    pub fn on_resume_rejected(&mut self) {
        self.pending_resume = None;
        self.attempt_count = 0;
        self.last_acked_seq = 0;
    }

    /// Build the resume request for the pending target, if any.
    #[must_use]
    pub fn resume_request(&self) -> Option<Envelope> {
        let previous = self.pending_resume.as_ref()?;
        Some(Envelope::client(
            protocol::CONNECTION_RESUME,
            json!({
                "previousConnectionId": previous,
                "lastAcknowledgedSequence": self.last_acked_seq,
            }),
        ))
    }

    /// Decide the reaction to a close code.
    pub fn handle_close(&mut self, code: u16) -> Decision {
        match policy_for(code) {
            ClosePolicy::Terminal => Decision::Stop,
            ClosePolicy::TerminalSilent => Decision::StopSilent,
            ClosePolicy::Reconnect => self.next_attempt(),
        }
    }

    /// Decide the reaction to a dial failure (no close code involved).
    pub fn handle_connect_failure(&mut self) -> Decision {
        self.next_attempt()
    }

    fn next_attempt(&mut self) -> Decision {
        if self.attempt_count >= self.config.max_attempts {
            debug!(attempts = self.attempt_count, "reconnect attempts exhausted");
            return Decision::GiveUp;
        }
        let attempt = self.attempt_count;
        let random = rand::rng().random::<f64>();
        let delay_ms = backoff_delay_with_random(
            attempt,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            self.config.jitter_factor,
            random,
        );
        self.attempt_count += 1;
        debug!(attempt, delay_ms, "scheduling reconnect");
        Decision::Reconnect {
            delay: Duration::from_millis(delay_ms),
            attempt,
        }
    }
}
