//! Prometheus metrics recorder and metric-name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics`
/// endpoint. Call once at server startup before any metrics are
/// recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
#[must_use]
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections accepted total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Live sessions (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Session duration seconds (histogram).
pub const WS_SESSION_DURATION_SECONDS: &str = "ws_session_duration_seconds";
/// Messages routed total (counter, labels: kind).
pub const MESSAGES_ROUTED_TOTAL: &str = "messages_routed_total";
/// Routing errors total (counter, labels: kind, code).
pub const ROUTE_ERRORS_TOTAL: &str = "route_errors_total";
/// Route duration seconds (histogram, labels: kind).
pub const ROUTE_DURATION_SECONDS: &str = "route_duration_seconds";
/// Broadcast sends dropped total (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Heartbeat pings sent total (counter).
pub const WS_HEARTBEAT_PINGS_TOTAL: &str = "ws_heartbeat_pings_total";
/// Stale-sweep evictions total (counter).
pub const WS_IDLE_EVICTIONS_TOTAL: &str = "ws_idle_evictions_total";
/// Rate-limited messages total (counter).
pub const WS_RATE_LIMITED_TOTAL: &str = "ws_rate_limited_total";
/// Resume attempts total (counter, labels: outcome).
pub const WS_RESUMES_TOTAL: &str = "ws_resumes_total";
/// Frame decode failures total (counter).
pub const WS_DECODE_FAILURES_TOTAL: &str = "ws_decode_failures_total";
