//! # parley-core
//!
//! Shared protocol vocabulary for the Parley real-time messaging core.
//!
//! This crate provides the types every other Parley crate depends on:
//!
//! - **Envelope**: the typed, versioned wire message unit and its codec
//! - **Branded IDs**: `ConnectionId`, `GroupId`, `EnvelopeId`, `Identity`
//! - **Close codes**: the standard + application close-code space and the
//!   reconnect/terminal classification
//! - **Errors**: the `ProtocolError` taxonomy and the `system.error` body
//! - **Backoff**: exponential-backoff math for the reconnection controller

#![deny(unsafe_code)]

pub mod backoff;
pub mod close;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod protocol;
