//! Error types for the ble-central crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;

/// The main error type for this crate.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bluetooth-related error from the btleplug backend.
    #[cfg(feature = "btleplug")]
    #[error("Bluetooth error: {0}")]
    Bluetooth(std::sync::Arc<btleplug::Error>),

    /// The radio is not powered on, so no adapter request may be issued.
    #[error("Bluetooth adapter unavailable or not powered on")]
    AdapterUnavailable,

    /// A scan session is already active.
    #[error("Scan already in progress")]
    ScanAlreadyInProgress,

    /// Failed to establish a connection to the peer.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The operation was outstanding when the session left the connected state.
    #[error("Session closed")]
    SessionClosed,

    /// Operation requires a connection but the peer is not connected.
    #[error("Peer not connected")]
    NotConnected,

    /// The request is not valid in the session's current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was rejected.
        operation: &'static str,
        /// The state the session was in.
        state: ConnectionState,
    },

    /// The characteristic does not support the requested operation.
    #[error("Operation {operation} not supported by characteristic {uuid}")]
    UnsupportedOperation {
        /// The operation that was requested.
        operation: &'static str,
        /// The UUID of the characteristic.
        uuid: String,
    },

    /// Characteristic not found in the session's descriptor cache.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found in the session's descriptor cache.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The operation did not complete before its deadline.
    #[error("Operation timed out: {operation}")]
    OperationTimeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// The radio was powered off while the operation was running.
    #[error("Radio became unavailable")]
    RadioUnavailable,

    /// The transport reported a failure for a GATT operation.
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        /// The operation that failed.
        operation: &'static str,
        /// Transport-reported reason.
        reason: String,
    },

    /// The caller stopped waiting for the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A UUID or identifier string could not be parsed.
    #[error("Invalid identifier: {value}")]
    InvalidIdentifier {
        /// The rejected input.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Bluetooth(std::sync::Arc::new(e))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CharacteristicNotFound {
            uuid: "2a19".to_string(),
        };
        assert_eq!(err.to_string(), "Characteristic not found: 2a19");

        let err = Error::InvalidState {
            operation: "connect",
            state: ConnectionState::Connected,
        };
        assert_eq!(err.to_string(), "Cannot connect while Connected");

        let err = Error::OperationTimeout { operation: "read" };
        assert_eq!(err.to_string(), "Operation timed out: read");
    }
}
