//! Server configuration.

use serde::{Deserialize, Serialize};

use parley_core::protocol;

/// Configuration for the Parley server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server-initiated pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Interval between stale-connection sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Inactivity threshold after which a connection is evicted, in seconds.
    pub stale_threshold_secs: u64,
    /// How long a dead connection stays resumable, in seconds.
    pub resume_window_secs: u64,
    /// Bound on a single transport write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Capacity of each connection's outbound send queue.
    pub max_send_queue: usize,
    /// Rate-limit window, in seconds.
    pub rate_limit_window_secs: u64,
    /// Messages admitted per identity per window.
    pub rate_limit_max: usize,
    /// Close an identity's older connection when a new one arrives.
    pub single_session_per_identity: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval_secs: protocol::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            sweep_interval_secs: protocol::DEFAULT_SWEEP_INTERVAL_SECS,
            stale_threshold_secs: protocol::DEFAULT_STALE_THRESHOLD_SECS,
            resume_window_secs: 120,
            write_timeout_ms: 5000,
            max_send_queue: 256,
            rate_limit_window_secs: 60,
            rate_limit_max: 120,
            single_session_per_identity: false,
        }
    }
}

/// Configuration validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The stale threshold would evict after a single missed ping.
    #[error(
        "stale_threshold_secs ({threshold}) must be at least twice \
         heartbeat_interval_secs ({heartbeat})"
    )]
    ThresholdTooTight {
        /// Configured stale threshold.
        threshold: u64,
        /// Configured heartbeat interval.
        heartbeat: u64,
    },
    /// A zero interval would busy-loop a background task.
    #[error("{field} must be non-zero")]
    ZeroInterval {
        /// Offending field name.
        field: &'static str,
    },
}

impl ServerConfig {
    /// Validate cross-field constraints.
    ///
    /// The stale threshold must be strictly larger than a small multiple
    /// of the heartbeat interval so one missed ping never evicts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("stale_threshold_secs", self.stale_threshold_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { field });
            }
        }
        if self.stale_threshold_secs < 2 * self.heartbeat_interval_secs {
            return Err(ConfigError::ThresholdTooTight {
                threshold: self.stale_threshold_secs,
                heartbeat: self.heartbeat_interval_secs,
            });
        }
        Ok(())
    }

    /// Apply `PARLEY_*` environment variable overrides.
    ///
    /// Invalid values are silently ignored (fall back to the current
    /// value); integers are range-checked before acceptance.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string("PARLEY_HOST") {
            self.host = v;
        }
        if let Some(v) = read_env_u64("PARLEY_PORT", 0, 65535) {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.port = v as u16;
            }
        }
        if let Some(v) = read_env_u64("PARLEY_MAX_CONNECTIONS", 1, 1_000_000) {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.max_connections = v as usize;
            }
        }
        if let Some(v) = read_env_u64("PARLEY_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = read_env_u64("PARLEY_SWEEP_INTERVAL_SECS", 1, 3600) {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = read_env_u64("PARLEY_STALE_THRESHOLD_SECS", 1, 86_400) {
            self.stale_threshold_secs = v;
        }
        if let Some(v) = read_env_u64("PARLEY_RATE_LIMIT_MAX", 1, 1_000_000) {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.rate_limit_max = v as usize;
            }
        }
        if let Some(v) = read_env_bool("PARLEY_SINGLE_SESSION") {
            self.single_session_per_identity = v;
        }
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    parse_u64(&std::env::var(name).ok()?, min, max)
}

fn read_env_bool(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn parse_u64(value: &str, min: u64, max: u64) -> Option<u64> {
    value.parse::<u64>().ok().filter(|v| (min..=max).contains(v))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
