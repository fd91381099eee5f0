//! Message-kind constants and protocol-level defaults.
//!
//! Envelope kinds are hierarchical strings of the form
//! `plane.category.action` (e.g. `system.ping`). The `system` plane is
//! reserved for connection-lifecycle traffic and is exempt from rate
//! limiting; everything else is domain traffic routed through the
//! registered handlers.

// ── Envelope kinds ──────────────────────────────────────────────────

/// Server → client handshake sent immediately after accept.
pub const CONNECTION_ESTABLISHED: &str = "system.connection.established";
/// Client → server resume request after an abnormal disconnect.
pub const CONNECTION_RESUME: &str = "system.connection.resume";
/// Server → client resume acknowledgement.
pub const CONNECTION_RESUMED: &str = "system.connection.resumed";
/// Server-initiated keepalive probe.
pub const SYSTEM_PING: &str = "system.ping";
/// Client keepalive answer reflecting the ping timestamp.
pub const SYSTEM_PONG: &str = "system.pong";
/// Server → client error report (recoverable errors never close).
pub const SYSTEM_ERROR: &str = "system.error";
/// Client signal that normal traffic is about to begin.
pub const CONTROL_FLOW_START: &str = "control.flow.start";

// ── Protocol constants ──────────────────────────────────────────────

/// Wire protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1";

/// Crate version (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capabilities advertised in the handshake.
pub const CAPABILITIES: &[&str] = &["heartbeat", "resume", "groups"];

/// Default interval between server-initiated pings, in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default interval between stale-connection sweeps, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default inactivity threshold after which a connection is evicted.
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 300;

// ── Kind helpers ────────────────────────────────────────────────────

/// The `plane` segment of a hierarchical kind (`system.ping` → `system`).
#[must_use]
pub fn plane(kind: &str) -> &str {
    kind.split('.').next().unwrap_or(kind)
}

/// Whether a kind belongs to the reserved `system` plane.
#[must_use]
pub fn is_system(kind: &str) -> bool {
    plane(kind) == "system"
}
