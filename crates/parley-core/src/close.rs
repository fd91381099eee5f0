//! Close-code space and the reconnect/terminal classification.
//!
//! Two code families: the standard transport-level codes the protocol
//! uses (1000/1006/1011/1012/1013) and an application range 4000–4999
//! partitioned by failure class. The client's reconnection controller
//! keys off [`policy_for`], so these values are wire compatibility —
//! do not renumber.

// ── Standard transport codes ────────────────────────────────────────

/// Deliberate normal closure. Terminal.
pub const NORMAL: u16 = 1000;
/// Abnormal closure (no close frame received). Recoverable.
pub const ABNORMAL: u16 = 1006;
/// Server hit an unexpected condition. Recoverable.
pub const INTERNAL_ERROR: u16 = 1011;
/// Server is restarting. Recoverable.
pub const SERVICE_RESTART: u16 = 1012;
/// Server is overloaded, try again later. Recoverable.
pub const TRY_AGAIN_LATER: u16 = 1013;

// ── Application range 4000–4999 ─────────────────────────────────────
//
// 4000–4099 authentication (terminal)
// 4100–4199 protocol errors (terminal)
// 4200–4299 transient server-side conditions (recoverable)
// 4300–4399 duplicate session (terminal, close silently)

/// Identity verification rejected the token.
pub const AUTH_FAILED: u16 = 4001;
/// A previously valid token expired mid-session.
pub const AUTH_EXPIRED: u16 = 4002;
/// Client and server protocol versions are incompatible.
pub const VERSION_MISMATCH: u16 = 4101;
/// The client violated the protocol in an unrecoverable way.
pub const PROTOCOL_VIOLATION: u16 = 4102;
/// The client exceeded its admission rate; a retry delay accompanies it.
pub const RATE_LIMITED: u16 = 4201;
/// The stale sweep evicted an idle connection.
pub const IDLE_TIMEOUT: u16 = 4202;
/// The session group was torn down while members were connected.
pub const GROUP_CLOSED: u16 = 4203;
/// Another connection for the same identity displaced this one.
pub const DUPLICATE_SESSION: u16 = 4301;

/// What a client should do after observing a close code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Abnormal-but-transient: schedule a reconnect attempt.
    Reconnect,
    /// Terminal: stop, surface the failure to the user.
    Terminal,
    /// Terminal: stop without any user-facing error.
    TerminalSilent,
}

/// Classify a close code into the client-side reaction it requires.
#[must_use]
pub fn policy_for(code: u16) -> ClosePolicy {
    match code {
        ABNORMAL | INTERNAL_ERROR | SERVICE_RESTART | TRY_AGAIN_LATER => ClosePolicy::Reconnect,
        4200..=4299 => ClosePolicy::Reconnect,
        4300..=4399 => ClosePolicy::TerminalSilent,
        // NORMAL, the auth and protocol bands, and anything unrecognized
        // in the application space.
        _ => ClosePolicy::Terminal,
    }
}

/// Whether a close code permits automatic reconnection.
#[must_use]
pub fn is_recoverable(code: u16) -> bool {
    policy_for(code) == ClosePolicy::Reconnect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_closure_is_terminal() {
        assert_eq!(policy_for(NORMAL), ClosePolicy::Terminal);
        assert!(!is_recoverable(NORMAL));
    }

    #[test]
    fn standard_abnormal_codes_reconnect() {
        for code in [ABNORMAL, INTERNAL_ERROR, SERVICE_RESTART, TRY_AGAIN_LATER] {
            assert_eq!(policy_for(code), ClosePolicy::Reconnect, "code {code}");
        }
    }

    #[test]
    fn auth_band_is_terminal() {
        assert_eq!(policy_for(AUTH_FAILED), ClosePolicy::Terminal);
        assert_eq!(policy_for(AUTH_EXPIRED), ClosePolicy::Terminal);
        assert_eq!(policy_for(4099), ClosePolicy::Terminal);
    }

    #[test]
    fn protocol_band_is_terminal() {
        assert_eq!(policy_for(VERSION_MISMATCH), ClosePolicy::Terminal);
        assert_eq!(policy_for(PROTOCOL_VIOLATION), ClosePolicy::Terminal);
    }

    #[test]
    fn transient_band_reconnects() {
        for code in [RATE_LIMITED, IDLE_TIMEOUT, GROUP_CLOSED, 4299] {
            assert_eq!(policy_for(code), ClosePolicy::Reconnect, "code {code}");
        }
    }

    #[test]
    fn duplicate_session_is_silent() {
        assert_eq!(policy_for(DUPLICATE_SESSION), ClosePolicy::TerminalSilent);
        assert_eq!(policy_for(4399), ClosePolicy::TerminalSilent);
    }

    #[test]
    fn unknown_application_codes_are_terminal() {
        assert_eq!(policy_for(4000), ClosePolicy::Terminal);
        assert_eq!(policy_for(4500), ClosePolicy::Terminal);
        assert_eq!(policy_for(4999), ClosePolicy::Terminal);
    }

    #[test]
    fn code_values_are_wire_stable() {
        // Compatibility pins: renumbering breaks deployed clients.
        assert_eq!(NORMAL, 1000);
        assert_eq!(ABNORMAL, 1006);
        assert_eq!(INTERNAL_ERROR, 1011);
        assert_eq!(SERVICE_RESTART, 1012);
        assert_eq!(TRY_AGAIN_LATER, 1013);
        assert_eq!(AUTH_FAILED, 4001);
        assert_eq!(VERSION_MISMATCH, 4101);
        assert_eq!(RATE_LIMITED, 4201);
        assert_eq!(IDLE_TIMEOUT, 4202);
        assert_eq!(DUPLICATE_SESSION, 4301);
    }
}
