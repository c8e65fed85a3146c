//! BLE central-role building blocks.
//!
//! Radio state tracking, scanning, connection state, GATT descriptors, the
//! per-session operation queue and notification subscriptions.

pub mod advertising;
pub mod characteristics;
pub mod connection;
pub mod queue;
pub mod radio;
pub mod scanner;
pub mod subscription;
pub mod uuids;

pub use advertising::{Advertisement, AdvertisementData, DiscoveredDevice, PeerId};
pub use characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, GattOperation, ServiceDescriptor,
};
pub use connection::{ConnectionEvent, ConnectionState, DisconnectReason};
pub use queue::{OperationId, OperationKind};
pub use radio::{RadioMonitor, RadioState};
pub use scanner::{ScanHandle, Scanner};
pub use subscription::{NotificationEvent, NotificationStream};
pub use uuids::*;
