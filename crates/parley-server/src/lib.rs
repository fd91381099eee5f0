//! # parley-server
//!
//! The server half of the Parley real-time messaging core.
//!
//! - `WebSocket` gateway: upgrade endpoint, per-connection receive loops
//! - Connection registry: identity and group indexes, heartbeat and
//!   stale-connection sweeps, group broadcast fan-out
//! - Message router: type → handler dispatch through an ordered
//!   middleware chain (rate limiting lives here)
//! - Cross-instance bridge: pluggable pub/sub republication so multiple
//!   server processes stay consistent for the same group
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod bridge;
pub mod config;
pub mod health;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod shutdown;
pub mod ws;
