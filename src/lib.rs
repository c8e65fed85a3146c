// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-central
//!
//! An async Bluetooth Low Energy central-role session manager.
//!
//! The library sits between application code and a platform BLE stack. It
//! tracks the radio state, runs bounded scan sessions, drives one connection
//! state machine per peer and serializes every GATT request for a peer
//! through a FIFO queue, so at most one request is ever outstanding on a
//! link.
//!
//! ## Features
//!
//! - **Radio state**: current state, change stream and callbacks
//! - **Scanning**: timed scan sessions with service filters and de-duplicated results
//! - **Sessions**: connect/disconnect with timeouts, link loss handling
//! - **GATT**: validated and queued discovery, read, write, subscribe and unsubscribe
//! - **Notifications**: one ordered stream per subscribed characteristic
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central::{CentralConfig, CentralManager, Result};
//! use std::time::Duration;
//!
//! # #[cfg(feature = "btleplug")]
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let central = CentralManager::with_btleplug(CentralConfig::default()).await?;
//!
//!     let devices = central.scan_for(Duration::from_secs(10)).await?;
//!     let Some(device) = devices.first() else {
//!         return Ok(());
//!     };
//!
//!     let session = central.session_for(device);
//!     session.connect().await?;
//!     for (service, characteristics) in session.discover_all().await? {
//!         println!("{}: {} characteristics", service.uuid, characteristics.len());
//!     }
//!
//!     central.shutdown().await
//! }
//! # #[cfg(not(feature = "btleplug"))]
//! # fn main() {}
//! ```
//!
//! ## Platform Notes
//!
//! The `btleplug` backend requires BlueZ on Linux (the user may need to be in
//! the `bluetooth` group), Bluetooth permission on macOS
//! (`NSBluetoothAlwaysUsageDescription` for bundled apps) and Windows 10 or
//! later. Other stacks can be plugged in by implementing [`Transport`].
//!
//! ## Feature Flags
//!
//! - `btleplug`: Enable the cross-platform [`BtleplugTransport`] backend
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod callback;
pub mod central_manager;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use callback::CallbackHandle;
pub use central_manager::CentralManager;
pub use config::CentralConfig;
pub use error::{Error, Result};
pub use session::DeviceSession;
pub use transport::{EventFanout, Transport, TransportEvent};

#[cfg(feature = "btleplug")]
pub use transport::BtleplugTransport;

// Re-export commonly used types from submodules
pub use ble::{
    Advertisement, AdvertisementData, CharacteristicDescriptor, CharacteristicProperties,
    ConnectionEvent, ConnectionState, DisconnectReason, DiscoveredDevice, GattOperation,
    NotificationEvent, NotificationStream, OperationKind, PeerId, RadioMonitor, RadioState,
    ScanHandle, Scanner, ServiceDescriptor,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<CentralManager>();
        let _ = std::any::TypeId::of::<DeviceSession>();
        let _ = std::any::TypeId::of::<Scanner>();
        let _ = std::any::TypeId::of::<NotificationStream>();
        let _ = std::any::TypeId::of::<Error>();
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CentralManager>();
        assert_send_sync::<DeviceSession>();
        assert_send_sync::<NotificationStream>();
    }
}
