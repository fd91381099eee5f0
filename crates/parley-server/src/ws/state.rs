//! Connection lifecycle state machine.
//!
//! The machine gates every lifecycle mutation: a transition either
//! matches an edge in the table below or fails without mutating state.
//! Failed transitions are caller bugs and must be logged by the caller,
//! never silently ignored. `Closed` is terminal: it has no outgoing
//! edges, and operations against a closed connection fail explicitly.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Retained transitions for diagnostics.
const HISTORY_CAPACITY: usize = 32;

/// Lifecycle states of a server-side connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Transport upgrade in progress.
    Connecting,
    /// Accepted and registered; handshake emitted.
    Connected,
    /// Identity bound to the connection.
    Authenticated,
    /// Normal traffic flowing.
    Active,
    /// Traffic suspended by the client.
    Paused,
    /// A resume of this connection's session is in progress.
    Reconnecting,
    /// Close initiated, transport draining.
    Closing,
    /// Terminal. No outgoing transitions.
    Closed,
}

impl ConnectionState {
    /// The legal successor states of `self`.
    #[must_use]
    pub fn successors(self) -> &'static [ConnectionState] {
        use ConnectionState::{
            Active, Authenticated, Closed, Closing, Connected, Connecting, Paused, Reconnecting,
        };
        match self {
            Connecting => &[Connected, Closed],
            Connected => &[Authenticated, Closing],
            Authenticated => &[Active, Closing],
            Active => &[Paused, Reconnecting, Closing, Closed],
            Paused => &[Active, Closing],
            Reconnecting => &[Active, Closing, Closed],
            Closing => &[Closed],
            Closed => &[],
        }
    }

    /// Whether this state has no outgoing edges.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A rejected transition. Leaves the machine untouched.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ConnectionState,
    /// State the caller requested.
    pub to: ConnectionState,
}

/// One recorded transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Source state.
    pub from: ConnectionState,
    /// Destination state.
    pub to: ConnectionState,
}

/// The per-connection state machine with a bounded transition history.
#[derive(Debug)]
pub struct StateMachine {
    current: ConnectionState,
    history: VecDeque<Transition>,
}

impl StateMachine {
    /// New machine in `Connecting`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Connecting,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// Whether the machine has reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current.is_terminal()
    }

    /// Pure check: would `transition(to)` succeed right now?
    #[must_use]
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        self.current.successors().contains(&to)
    }

    /// Attempt a transition. Failure leaves the state untouched.
    pub fn transition(&mut self, to: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition {
                from: self.current,
                to,
            });
        }
        if self.history.len() == HISTORY_CAPACITY {
            let _ = self.history.pop_front();
        }
        self.history.push_back(Transition {
            from: self.current,
            to,
        });
        self.current = to;
        Ok(())
    }

    /// Recorded transitions, oldest first.
    #[must_use]
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
