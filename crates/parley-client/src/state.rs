//! Client connection lifecycle state machine.
//!
//! Same contract as the server-side machine: `can_transition` is pure,
//! a failed `transition` leaves the state untouched, and `Closed` is
//! terminal. `Reconnecting` re-enters the dial path through
//! `Connecting` (or jumps straight to `Active` once a resumed socket is
//! live).

use std::fmt;

/// Lifecycle states of the client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No transport; nothing scheduled.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// Transport open, handshake pending or received.
    Connected,
    /// Normal traffic flowing.
    Active,
    /// Abnormal closure observed; a reconnect attempt is scheduled.
    Reconnecting,
    /// Terminal: deliberate close, terminal close code, or attempts
    /// exhausted.
    Closed,
}

impl ClientState {
    /// The legal successor states of `self`.
    #[must_use]
    pub fn successors(self) -> &'static [ClientState] {
        use ClientState::{Active, Closed, Connected, Connecting, Disconnected, Reconnecting};
        match self {
            Disconnected => &[Connecting],
            Connecting => &[Connected, Reconnecting, Closed],
            Connected => &[Active, Reconnecting, Closed],
            Active => &[Reconnecting, Closed],
            Reconnecting => &[Connecting, Active, Closed],
            Closed => &[],
        }
    }

    /// Whether this state has no outgoing edges.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ClientState::Closed
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A rejected transition.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid client transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ClientState,
    /// State the caller requested.
    pub to: ClientState,
}

/// The client state machine.
#[derive(Debug)]
pub struct ClientStateMachine {
    current: ClientState,
}

impl ClientStateMachine {
    /// New machine in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ClientState::Disconnected,
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ClientState {
        self.current
    }

    /// Pure check: would `transition(to)` succeed right now?
    #[must_use]
    pub fn can_transition(&self, to: ClientState) -> bool {
        self.current.successors().contains(&to)
    }

    /// Attempt a transition. Failure leaves the state untouched.
    pub fn transition(&mut self, to: ClientState) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition {
                from: self.current,
                to,
            });
        }
        self.current = to;
        Ok(())
    }
}

impl Default for ClientStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
