//! Connection Protocol Types
//!
//! Shared vocabulary for the connection lifecycle: client identity, the
//! read/write connection mode, and the connection state machine with its
//! legal transition set.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──on_connect()──> CatchingUp ──promotion──> Connected
//!       ▲                            │                         │
//!       └────────on_disconnect()─────┴─────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;


/// Client identifier assigned by the relay service, one per connection
pub type ClientId = Arc<str>;

/// Connection mode granted by the relay service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// May observe the op stream without joining the quorum
    Read,
    /// May submit ops; must be acknowledged by a Join op
    Write,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Read => "read",
            ConnectionMode::Write => "write",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, ConnectionMode::Write)
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details reported by the transport once a socket is open and the relay
/// has assigned a client identifier
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    /// Identifier assigned to this connection
    pub client_id: ClientId,
}

impl ConnectionDetails {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

/// Connection state as observed by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live connection
    #[default]
    Disconnected,
    /// Socket is open; waiting for the Join/Leave preconditions before the
    /// connection is safe to use for submission
    CatchingUp,
    /// Fully connected; the promoted client id is live for the op stream
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    pub fn is_catching_up(&self) -> bool {
        matches!(self, ConnectionState::CatchingUp)
    }

    /// Check if a transition to the new state is legal
    pub fn can_transition_to(&self, new_state: ConnectionState) -> bool {
        matches!(
            (self, new_state),
            (ConnectionState::Disconnected, ConnectionState::CatchingUp)
                | (ConnectionState::CatchingUp, ConnectionState::Connected)
                | (ConnectionState::CatchingUp, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::CatchingUp => "CatchingUp",
            ConnectionState::Connected => "Connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
