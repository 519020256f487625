//! Realtime connection state as reported by the transport.

use serde::{Deserialize, Serialize};

/// Connectivity of the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Channel joined and healthy.
    Connected,
    /// No connection.
    Disconnected,
    /// Attempting to re-establish the connection.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` for [`ConnectionState::Connected`].
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether moving from `previous` to `next` re-establishes connectivity.
    ///
    /// Only `Disconnected`/`Reconnecting` -> `Connected` qualifies.
    #[must_use]
    pub const fn is_reconnect(previous: Self, next: Self) -> bool {
        !previous.is_connected() && next.is_connected()
    }
}

/// Connection state plus the number of times the link has been
/// re-established.
///
/// Observers of a `watch` channel only see the latest value. A quick
/// disconnect and reconnect leaves `state` unchanged but still bumps
/// `connects`, so the reconnect is not lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Current connectivity.
    pub state: ConnectionState,
    /// Transitions into [`ConnectionState::Connected`] so far.
    pub connects: u64,
}

impl ConnectionStatus {
    /// Status starting at `state` with no reconnects counted.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self { state, connects: 0 }
    }

    /// Move to `next`. Returns `false` if `next` is the current state.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if ConnectionState::is_reconnect(self.state, next) {
            self.connects += 1;
        }
        self.state = next;
        true
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
