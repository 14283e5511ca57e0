// src/connection/state.rs

//! Lifecycle states of a connection and the status value published to callers.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initial state, before the first `connect()`.
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    /// The transport failed; waiting out the backoff before the next attempt.
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    /// True while the worker is trying to (re)establish the connection.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Handshaking
                | ConnectionState::Reconnecting
        )
    }

    /// Whether moving from `self` to `next` is allowed. Once a close has
    /// begun the worker may only finish it.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match self {
            ConnectionState::Closing => next == ConnectionState::Closed,
            ConnectionState::Closed => next == ConnectionState::Connecting,
            _ => true,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot published through a `watch` channel on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Incremented every time a physical connection reaches `Connected`.
    pub epoch: u64,
    /// Incremented every time a connect attempt finishes, successfully or not.
    pub attempts: u64,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempts: 0,
        }
    }
}
