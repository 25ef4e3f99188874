//! Connection finite-state machine.
//!
//! ```text
//!                  ┌──────────── failure ───────────┐
//!                  ▼                                │
//! DISCONNECTED ─▶ CONNECTING ─▶ CONNECTED ─▶ DISCONNECTING ─▶ DISCONNECTED
//!   │    ▲            ▲            │  │
//!   │    │            │            │  └── lost ──▶ DISCONNECTED(reason)
//!   │    └─ give up ─ RECONNECTING ◀┘
//!   └── schedule ───▶ RECONNECTING
//! ```
//!
//! Every move goes through [`StateMachine::transition`], pairs outside the
//! table are rejected and leave the state untouched.

use std::fmt;

use snafu::prelude::*;

/// Why a connection entered the disconnected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// caller asked for it, never reconnected automatically
    UserInitiated,
    /// transport failed or connect attempt failed
    Error,
    /// too many heartbeat probes went unanswered
    HeartbeatTimeout,
    /// the remote end closed the stream
    RemoteClosed,
}

impl DisconnectReason {
    /// Check if the reconnection engine may act on this reason
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::UserInitiated)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserInitiated => "user initiated",
            Self::Error => "error",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::RemoteClosed => "remote closed",
        };
        f.write_str(s)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session, carries why
    Disconnected(DisconnectReason),
    /// Waiting the transport handshake
    Connecting,
    /// Session is up, data flows
    Connected,
    /// Waiting the scheduled reconnect attempt with this zero-based index
    Reconnecting {
        /// attempt index handed to the reconnection policy
        attempt: u32,
    },
    /// Closing on caller request
    Disconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected(DisconnectReason::UserInitiated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(reason) => write!(f, "disconnected({})", reason),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({})", attempt),
            Self::Disconnecting => f.write_str("disconnecting"),
        }
    }
}

impl ConnectionState {
    /// Check if moving from self to `to` is a legal transition
    pub fn can_transition_to(&self, to: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            (Disconnected(_), Connecting) => true,
            (Disconnected(from), Reconnecting { .. }) => from.is_recoverable(),
            (Connecting, Connected) => true,
            (Connecting, Disconnected(_)) => true,
            (Connected, Disconnecting) => true,
            (Connected, Reconnecting { .. }) => true,
            (Connected, Disconnected(reason)) => reason.is_recoverable(),
            (Disconnecting, Disconnected(_)) => true,
            (Reconnecting { .. }, Connecting) => true,
            (Reconnecting { .. }, Disconnected(_)) => true,
            _ => false,
        }
    }

    /// true if in connected state
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Error when a transition is not in the table
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("invalid connection state transition {from} -> {to}"))]
pub struct InvalidTransition {
    /// state before
    pub from: ConnectionState,
    /// rejected target
    pub to: ConnectionState,
}

/// Single owner of a [`ConnectionState`] cell.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    /// Create a machine in the given state
    pub fn new(state: ConnectionState) -> Self {
        Self { state }
    }

    /// current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        ensure!(
            self.state.can_transition_to(&to),
            InvalidTransitionSnafu {
                from: self.state,
                to
            }
        );

        log::trace!("Connection state {} -> {}", self.state, to);

        Ok(std::mem::replace(&mut self.state, to))
    }
}
