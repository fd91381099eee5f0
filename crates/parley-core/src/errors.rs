//! Protocol error taxonomy and the `system.error` wire body.
//!
//! Every error surfaced to a client carries a stable machine-readable
//! code, a category, a human-readable message, and a `recoverable` flag;
//! recoverable errors with a known retry delay include it so clients do
//! not guess a backoff.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::protocol;

// ── Error code constants ────────────────────────────────────────────

/// A frame could not be decoded into an envelope.
pub const DECODE_FAILED: &str = "DECODE_FAILED";
/// Identity verification failed at accept time.
pub const AUTH_FAILED: &str = "AUTH_FAILED";
/// Admission denied by the rate limiter.
pub const RATE_LIMITED: &str = "RATE_LIMITED";
/// The operation is not permitted in the connection's current state.
pub const INVALID_STATE: &str = "INVALID_STATE";
/// A resume request referenced an unknown or expired connection.
pub const RESUME_REJECTED: &str = "RESUME_REJECTED";
/// The envelope referenced a group the connection is not a member of.
pub const NOT_IN_GROUP: &str = "NOT_IN_GROUP";
/// A domain handler rejected the message.
pub const DOMAIN_REJECTED: &str = "DOMAIN_REJECTED";
/// A handler exceeded its execution deadline.
pub const HANDLER_TIMEOUT: &str = "HANDLER_TIMEOUT";
/// Unexpected internal failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Failure classes, matching the propagation policy each requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    /// Socket-level I/O failure. Always recoverable by reconnection.
    Transport,
    /// Identity verification failed. Terminal.
    Authentication,
    /// Malformed envelope or payload. Recoverable, connection stays open.
    Validation,
    /// Domain-level rejection. Recoverable, typed error code.
    Business,
    /// Unexpected internal failure. Recoverable via backoff.
    Server,
    /// Admission denied. Recoverable after the suggested delay.
    RateLimit,
}

/// Wire body carried inside a `system.error` envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Failure class.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Whether the client may retry.
    pub recoverable: bool,
    /// Suggested retry delay for recoverable errors, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Error type produced by the routing layer and handlers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame decode failure. Never closes the connection.
    #[error("{message}")]
    Validation {
        /// Specific code (defaults to [`DECODE_FAILED`] at the codec).
        code: String,
        /// Description of what is wrong.
        message: String,
    },

    /// Identity verification failure.
    #[error("{message}")]
    Authentication {
        /// Description.
        message: String,
    },

    /// Admission denied by the rate limiter.
    #[error("rate limit exceeded")]
    RateLimit {
        /// Suggested delay before retrying.
        retry_after_ms: u64,
    },

    /// Domain-level rejection with a machine-readable code.
    #[error("{message}")]
    Business {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl ProtocolError {
    /// Convenience constructor for decode failures.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Validation {
            code: DECODE_FAILED.to_owned(),
            message: message.into(),
        }
    }

    /// Machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. } | Self::Business { code, .. } => code,
            Self::Authentication { .. } => AUTH_FAILED,
            Self::RateLimit { .. } => RATE_LIMITED,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Failure class.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::RateLimit { .. } => ErrorCategory::RateLimit,
            Self::Business { .. } => ErrorCategory::Business,
            Self::Internal { .. } => ErrorCategory::Server,
        }
    }

    /// Whether the client may retry after this error.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Authentication { .. })
    }

    /// Suggested retry delay, when one applies.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Convert to the wire-format error body.
    #[must_use]
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            category: self.category(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            retry_after_ms: self.retry_after_ms(),
        }
    }

    /// Build the `system.error` envelope reporting this error.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        let body = self.to_error_body();
        let payload = serde_json::to_value(&body).unwrap_or(Value::Null);
        Envelope::server(protocol::SYSTEM_ERROR, payload)
    }
}
