//! Per-identity admission control.
//!
//! A fixed-window counter over per-key timestamp lists. Keys shard
//! across the `DashMap`, so checks for unrelated identities never
//! serialize. The middleware adapter exempts system-plane messages
//! unconditionally and rejects by sending a `system.error` envelope
//! with the suggested retry delay — it does not close the connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tracing::debug;

use parley_core::envelope::Envelope;
use parley_core::errors::ProtocolError;

use crate::routing::middleware::{Middleware, Next};
use crate::routing::router::RouterContext;
use crate::ws::connection::Connection;

/// Fixed-window rate limiter keyed by an arbitrary string.
pub struct FixedWindowLimiter {
    window: Duration,
    max: usize,
    buckets: DashMap<String, Vec<Instant>>,
}

impl FixedWindowLimiter {
    /// Admit at most `max` checks per `window` per key.
    #[must_use]
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            buckets: DashMap::new(),
        }
    }

    /// Check (and on acceptance record) one admission for `key`.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_owned()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() < self.max {
            entry.push(now);
            true
        } else {
            false
        }
    }

    /// How long until the oldest recorded admission leaves the window.
    #[must_use]
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        let entry = self.buckets.get(key)?;
        let oldest = entry.first()?;
        Some(self.window.saturating_sub(oldest.elapsed()))
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// Middleware enforcing the limiter per identity.
pub struct RateLimitMiddleware {
    limiter: FixedWindowLimiter,
    exempt: HashSet<String>,
}

impl RateLimitMiddleware {
    /// Wrap a limiter. System-plane kinds are always exempt; `exempt`
    /// adds further kinds.
    #[must_use]
    pub fn new(limiter: FixedWindowLimiter, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            limiter,
            exempt: exempt.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        _ctx: &RouterContext,
        next: Next<'_>,
    ) -> Result<(), ProtocolError> {
        if envelope.is_system() || self.exempt.contains(envelope.kind()) {
            return next.run(conn, envelope).await;
        }

        let key = conn.identity.as_str();
        if self.limiter.check(key) {
            return next.run(conn, envelope).await;
        }

        let retry_after_ms = self
            .limiter
            .retry_after(key)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        counter!("ws_rate_limited_total").increment(1);
        debug!(conn_id = %conn.id, identity = %conn.identity, retry_after_ms, "rate limited");

        let error = ProtocolError::RateLimit { retry_after_ms };
        if let Err(err) = conn.send(error.to_envelope()) {
            debug!(conn_id = %conn.id, %err, "could not deliver rate-limit error");
        }
        Ok(())
    }
}
