//! Connection state types.
//!
//! The state itself is owned by [`DeviceSession`](crate::DeviceSession);
//! this module only defines the states, the legal transitions between them
//! and the events emitted when they change.

use crate::ble::advertising::PeerId;

/// Connection state for a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the peer.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peer.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    /// Check whether moving to `next` is a legal transition.
    ///
    /// Every state may drop to `Disconnected` (link loss); otherwise the
    /// lifecycle only moves forward.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connecting | Connected | Disconnecting, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Why a session ended up disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// The application asked for the disconnect.
    Requested,
    /// The peer went away, the link dropped or the radio was switched off.
    LinkLost,
    /// The connection attempt failed or timed out.
    ConnectFailed,
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The peer whose state changed.
    pub peer: PeerId,
    /// The new connection state.
    pub state: ConnectionState,
    /// Set when `state` is `Disconnected`.
    pub reason: Option<DisconnectReason>,
}
