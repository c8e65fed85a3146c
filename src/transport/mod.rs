//! Transport adapter capability.
//!
//! The core never talks to a platform Bluetooth stack directly. Everything
//! goes through [`Transport`], which exposes the raw central-role GATT
//! primitives. Each request method resolves exactly once; asynchronous
//! platform callbacks (advertisements, link loss, notifications, radio
//! state) arrive on the receivers handed out by [`Transport::events`].
//!
//! Every receiver is unbounded and gets every event, so a busy peer or a
//! burst of advertisements can never push a link-loss or power-off event
//! out from under another consumer.
//!
//! Dropping a request future is the cancellation signal. Implementations
//! without a native cancel must make sure a late platform completion for a
//! dropped request is discarded rather than delivered to a newer request.

#[cfg(feature = "btleplug")]
pub mod btleplug;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::advertising::{Advertisement, PeerId};
use crate::ble::characteristics::{CharacteristicDescriptor, ServiceDescriptor};
use crate::ble::radio::RadioState;
use crate::error::Result;

#[cfg(feature = "btleplug")]
pub use self::btleplug::BtleplugTransport;

/// Low-level event reported by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The adapter's radio state changed.
    StateChanged(RadioState),
    /// An advertisement was received while scanning.
    Advertisement(Advertisement),
    /// The link to a peer went down.
    ///
    /// Emitted for peer-initiated disconnects, link loss, and as the
    /// confirmation of a requested disconnect.
    Disconnected {
        /// The peer whose link went down.
        peer: PeerId,
    },
    /// A notification or indication value arrived.
    Notification {
        /// The notifying peer.
        peer: PeerId,
        /// Owning service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// The value, passed through unchanged.
        value: Bytes,
    },
}

/// Raw platform BLE central primitives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current radio state.
    fn adapter_state(&self) -> RadioState;

    /// Subscribe to low-level transport events.
    ///
    /// Each call returns an independent receiver that sees every event
    /// reported after the call.
    fn events(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Start scanning. An empty filter means all devices.
    async fn start_scan(&self, filter: &[Uuid]) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peer. Resolves once the link is up.
    async fn connect(&self, peer: &PeerId) -> Result<()>;

    /// Disconnect from (or cancel a pending connection to) a peer.
    async fn disconnect(&self, peer: &PeerId) -> Result<()>;

    /// Discover services. An empty filter means all services.
    async fn discover_services(
        &self,
        peer: &PeerId,
        filter: &[Uuid],
    ) -> Result<Vec<ServiceDescriptor>>;

    /// Discover characteristics of a service. An empty filter means all.
    async fn discover_characteristics(
        &self,
        peer: &PeerId,
        service: &Uuid,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicDescriptor>>;

    /// Read a characteristic value.
    async fn read(&self, peer: &PeerId, characteristic: &CharacteristicDescriptor)
        -> Result<Bytes>;

    /// Write a characteristic value.
    async fn write(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        ack_required: bool,
    ) -> Result<()>;

    /// Enable notifications/indications.
    async fn subscribe(&self, peer: &PeerId, characteristic: &CharacteristicDescriptor)
        -> Result<()>;

    /// Disable notifications/indications.
    async fn unsubscribe(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<()>;
}

/// Lossless fan-out of [`TransportEvent`]s to any number of receivers.
///
/// Receivers that were dropped are pruned on the next send.
#[derive(Debug, Default)]
pub struct EventFanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventFanout {
    /// Create a fan-out with no receivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live receiver.
    pub fn send(&self, event: TransportEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live receivers, as of the last send.
    pub fn receiver_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
