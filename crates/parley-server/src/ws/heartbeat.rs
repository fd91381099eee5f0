//! Registry background loops: heartbeat pings and the stale sweep.
//!
//! Both are explicit cancellation-token-bearing select loops so that
//! shutdown ordering is a testable sequence rather than cooperative
//! scheduler cancellation. The heartbeat never evaluates timeouts
//! itself; eviction is the sweep's job, driven by each connection's
//! `last_activity` clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::ConnectionRegistry;

/// Send a `system.ping` to every live connection at each `interval`
/// tick until cancelled.
pub async fn run_heartbeat(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.ping_all().await;
            }
            () = cancel.cancelled() => {
                debug!("heartbeat loop cancelled");
                return;
            }
        }
    }
}

/// Evict connections idle past `threshold` at each `interval` tick
/// until cancelled. Also prunes expired resume state.
pub async fn run_stale_sweep(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.evict_stale(threshold).await;
                if evicted > 0 {
                    info!(evicted, "stale sweep evicted connections");
                }
                registry.prune_retired();
            }
            () = cancel.cancelled() => {
                debug!("stale sweep cancelled");
                return;
            }
        }
    }
}
