//! # parley-client
//!
//! The client-side counterpart of the Parley core: a reconnecting
//! WebSocket client that drives the handshake, answers keepalive pings,
//! and reclaims continuity after abnormal disconnects.
//!
//! - **State machine**: the client connection lifecycle
//! - **Reconnection controller**: close-code policy, jittered
//!   exponential backoff, attempt accounting
//! - **Client**: the tokio-tungstenite connect/receive loop

#![deny(unsafe_code)]

pub mod client;
pub mod reconnect;
pub mod state;
