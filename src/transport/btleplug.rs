//! [`Transport`] backed by btleplug.
//!
//! Works on Linux (BlueZ), macOS/iOS (CoreBluetooth) and Windows (WinRT).

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{EventFanout, Transport, TransportEvent};
use crate::ble::advertising::{Advertisement, AdvertisementData, PeerId};
use crate::ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor,
};
use crate::ble::radio::RadioState;
use crate::error::{Error, Result};

type PeripheralMap = Arc<RwLock<HashMap<PeerId, Peripheral>>>;

/// Transport using the first Bluetooth adapter of the platform.
pub struct BtleplugTransport {
    /// The BLE adapter.
    adapter: Adapter,
    /// Last reported radio state.
    state: Arc<Mutex<RadioState>>,
    /// Peripherals seen so far.
    peripherals: PeripheralMap,
    /// Receivers of transport events.
    events: Arc<EventFanout>,
    /// Handle to the adapter event task.
    event_handle: tokio::task::JoinHandle<()>,
    /// Notification forwarding tasks by peer.
    notification_handles: Mutex<HashMap<PeerId, tokio::task::JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the first adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if no adapter is present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::AdapterUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let events_fanout = Arc::new(EventFanout::new());
        let initial = match adapter.adapter_state().await {
            Ok(state) => radio_state_from(state),
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                RadioState::Unknown
            }
        };
        let state = Arc::new(Mutex::new(initial));
        let peripherals: PeripheralMap = Arc::new(RwLock::new(HashMap::new()));

        let events = adapter.events().await?;
        let event_handle = tokio::spawn(Self::pump_events(
            adapter.clone(),
            events,
            state.clone(),
            peripherals.clone(),
            events_fanout.clone(),
        ));

        Ok(Self {
            adapter,
            state,
            peripherals,
            events: events_fanout,
            event_handle,
            notification_handles: Mutex::new(HashMap::new()),
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn pump_events(
        adapter: Adapter,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        state: Arc<Mutex<RadioState>>,
        peripherals: PeripheralMap,
        fanout: Arc<EventFanout>,
    ) {
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                | CentralEvent::ServiceDataAdvertisement { id, .. }
                | CentralEvent::ServicesAdvertisement { id, .. } => {
                    if let Some(adv) = Self::advertisement(&adapter, &peripherals, id).await {
                        fanout.send(TransportEvent::Advertisement(adv));
                    }
                }
                CentralEvent::DeviceConnected(id) => {
                    debug!("Device connected: {:?}", id);
                }
                CentralEvent::DeviceDisconnected(id) => {
                    debug!("Device disconnected: {:?}", id);
                    fanout.send(TransportEvent::Disconnected {
                        peer: PeerId::new(id.to_string()),
                    });
                }
                CentralEvent::StateUpdate(central_state) => {
                    let radio = radio_state_from(central_state);
                    *state.lock() = radio;
                    fanout.send(TransportEvent::StateChanged(radio));
                }
            }
        }

        debug!("Adapter event stream ended");
    }

    async fn advertisement(
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        id: PeripheralId,
    ) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let peer = PeerId::new(id.to_string());
        peripherals.write().insert(peer.clone(), peripheral);

        Some(Advertisement {
            peer,
            local_name: properties.local_name,
            rssi: properties.rssi,
            data: AdvertisementData {
                manufacturer_data: properties
                    .manufacturer_data
                    .into_iter()
                    .map(|(company, data)| (company, Bytes::from(data)))
                    .collect(),
                service_data: properties
                    .service_data
                    .into_iter()
                    .map(|(uuid, data)| (uuid, Bytes::from(data)))
                    .collect(),
                services: properties.services,
                tx_power_level: properties.tx_power_level,
            },
        })
    }

    async fn peripheral(&self, peer: &PeerId) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.read().get(peer) {
            return Ok(p.clone());
        }

        // Not advertised during this run; the platform may still know it.
        let found = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == peer.as_str())
            .ok_or_else(|| Error::ConnectFailed {
                reason: format!("unknown peer {peer}"),
            })?;
        self.peripherals.write().insert(peer.clone(), found.clone());

        Ok(found)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == descriptor.uuid && c.service_uuid == descriptor.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: descriptor.uuid.to_string(),
            })
    }

    async fn forward_notifications(&self, peer: &PeerId, peripheral: Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let fanout = self.events.clone();
        let task_peer = peer.clone();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid);
                let Some(service) = service else {
                    trace!("Notification from unknown characteristic {}", notification.uuid);
                    continue;
                };

                fanout.send(TransportEvent::Notification {
                    peer: task_peer.clone(),
                    service,
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                });
            }
            debug!("Notification stream for {} ended", task_peer);
        });

        if let Some(previous) = self.notification_handles.lock().insert(peer.clone(), handle) {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    fn adapter_state(&self) -> RadioState {
        *self.state.lock()
    }

    fn events(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, filter: &[Uuid]) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: filter.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<()> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.connect().await?;
        self.forward_notifications(peer, peripheral).await
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        if let Some(handle) = self.notification_handles.lock().remove(peer) {
            handle.abort();
        }
        let peripheral = self.peripheral(peer).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(
        &self,
        peer: &PeerId,
        filter: &[Uuid],
    ) -> Result<Vec<ServiceDescriptor>> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
            .map(|s| ServiceDescriptor {
                uuid: s.uuid,
                primary: s.primary,
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        peer: &PeerId,
        service: &Uuid,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicDescriptor>> {
        let peripheral = self.peripheral(peer).await?;
        // Characteristics come with service discovery on every platform
        // btleplug supports.
        let found = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == *service)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })?;

        Ok(found
            .characteristics
            .into_iter()
            .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
            .map(|c| CharacteristicDescriptor {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                properties: properties_from_flags(c.properties),
            })
            .collect())
    }

    async fn read(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Bytes> {
        let peripheral = self.peripheral(peer).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let value = peripheral.read(&target).await?;
        Ok(Bytes::from(value))
    }

    async fn write(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        ack_required: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(peer).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = if ack_required {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(&target, value, write_type).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<()> {
        let peripheral = self.peripheral(peer).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<()> {
        let peripheral = self.peripheral(peer).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&target).await?;
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.event_handle.abort();
        for (_, handle) in self.notification_handles.lock().drain() {
            handle.abort();
        }
    }
}

fn radio_state_from(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    let mut properties = CharacteristicProperties::empty();
    for (flag, property) in [
        (CharPropFlags::READ, CharacteristicProperties::READ),
        (CharPropFlags::WRITE, CharacteristicProperties::WRITE),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ),
        (CharPropFlags::NOTIFY, CharacteristicProperties::NOTIFY),
        (CharPropFlags::INDICATE, CharacteristicProperties::INDICATE),
    ] {
        if flags.contains(flag) {
            properties = properties | property;
        }
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::characteristics::GattOperation;

    #[test]
    fn test_property_mapping() {
        let props = properties_from_flags(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert!(props.supports(GattOperation::Read));
        assert!(props.supports(GattOperation::Notify));
        assert!(!props.supports(GattOperation::Write));

        let props = properties_from_flags(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert!(props.supports(GattOperation::WriteWithoutResponse));
        assert!(!props.can_subscribe());
    }

    #[test]
    fn test_radio_state_mapping() {
        assert_eq!(radio_state_from(CentralState::PoweredOn), RadioState::PoweredOn);
        assert_eq!(radio_state_from(CentralState::PoweredOff), RadioState::PoweredOff);
        assert_eq!(radio_state_from(CentralState::Unknown), RadioState::Unknown);
    }
}
