//! Scriptable in-memory transport used by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::{EventFanout, Transport, TransportEvent};
use crate::ble::advertising::{Advertisement, AdvertisementData, PeerId};
use crate::ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor,
};
use crate::ble::radio::RadioState;
use crate::ble::uuids::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
use crate::error::{Error, Result};

/// Sample peripheral service.
pub(crate) const ROBOT_SERVICE_UUID: Uuid = Uuid::from_u128(0x00726f62_6f74_7061_6a61_6d61732e6361);
/// Write-only command characteristic.
pub(crate) const ROBOT_TX_UUID: Uuid = Uuid::from_u128(0x01726f62_6f74_7061_6a61_6d61732e6361);
/// Read/write/notify characteristic.
pub(crate) const ROBOT_RX_UUID: Uuid = Uuid::from_u128(0x02726f62_6f74_7061_6a61_6d61732e6361);

/// How the fake answers connect requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Clone, Default)]
struct FakePeer {
    services: Vec<ServiceDescriptor>,
    characteristics: Vec<CharacteristicDescriptor>,
}

pub(crate) struct FakeTransport {
    events: EventFanout,
    state: Mutex<RadioState>,
    peers: Mutex<HashMap<PeerId, FakePeer>>,
    values: Mutex<HashMap<(PeerId, Uuid), Bytes>>,
    connect_mode: Mutex<ConnectMode>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fail_gatt: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    start_scan_calls: AtomicUsize,
    stop_scan_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTransport {
    /// A powered-on transport with the sample robot peer registered.
    pub(crate) fn new() -> Arc<Self> {
        let fake = Arc::new(Self {
            events: EventFanout::new(),
            state: Mutex::new(RadioState::PoweredOn),
            peers: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            connect_mode: Mutex::new(ConnectMode::Succeed),
            gate: Mutex::new(None),
            fail_gatt: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            start_scan_calls: AtomicUsize::new(0),
            stop_scan_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        });
        fake.add_robot_peer(&PeerId::new("robot"));
        fake
    }

    pub(crate) fn add_robot_peer(&self, peer: &PeerId) {
        let chars = vec![
            CharacteristicDescriptor {
                uuid: ROBOT_TX_UUID,
                service_uuid: ROBOT_SERVICE_UUID,
                properties: CharacteristicProperties::WRITE
                    | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            },
            CharacteristicDescriptor {
                uuid: ROBOT_RX_UUID,
                service_uuid: ROBOT_SERVICE_UUID,
                properties: CharacteristicProperties::READ
                    | CharacteristicProperties::WRITE
                    | CharacteristicProperties::NOTIFY,
            },
            CharacteristicDescriptor {
                uuid: BATTERY_LEVEL_UUID,
                service_uuid: BATTERY_SERVICE_UUID,
                properties: CharacteristicProperties::READ,
            },
        ];
        let services = vec![
            ServiceDescriptor {
                uuid: ROBOT_SERVICE_UUID,
                primary: true,
            },
            ServiceDescriptor {
                uuid: BATTERY_SERVICE_UUID,
                primary: true,
            },
        ];
        self.peers.lock().insert(
            peer.clone(),
            FakePeer {
                services,
                characteristics: chars,
            },
        );
        self.values
            .lock()
            .insert((peer.clone(), BATTERY_LEVEL_UUID), Bytes::from_static(&[87]));
    }

    pub(crate) fn set_radio_state(&self, state: RadioState) {
        *self.state.lock() = state;
        self.events.send(TransportEvent::StateChanged(state));
    }

    pub(crate) fn set_connect_mode(&self, mode: ConnectMode) {
        *self.connect_mode.lock() = mode;
    }

    /// Make GATT requests wait until released.
    pub(crate) fn hold_gatt(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held GATT requests complete.
    pub(crate) fn release_gatt(&self, n: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Fail every GATT request with the given reason.
    pub(crate) fn fail_gatt(&self, reason: Option<&str>) {
        *self.fail_gatt.lock() = reason.map(str::to_string);
    }

    pub(crate) fn advertise(&self, peer: &str, name: Option<&str>, rssi: i16, services: &[Uuid]) {
        self.events.send(TransportEvent::Advertisement(Advertisement {
            peer: PeerId::new(peer),
            local_name: name.map(str::to_string),
            rssi: Some(rssi),
            data: AdvertisementData {
                services: services.to_vec(),
                ..Default::default()
            },
        }));
    }

    pub(crate) fn notify(&self, peer: &PeerId, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.events.send(TransportEvent::Notification {
            peer: peer.clone(),
            service,
            characteristic,
            value: Bytes::copy_from_slice(value),
        });
    }

    pub(crate) fn drop_link(&self, peer: &PeerId) {
        self.events
            .send(TransportEvent::Disconnected { peer: peer.clone() });
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn start_scan_calls(&self) -> usize {
        self.start_scan_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_scan_calls(&self) -> usize {
        self.stop_scan_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn peer(&self, peer: &PeerId) -> Result<FakePeer> {
        self.peers
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown fake peer {peer}")))
    }

    async fn gatt<T>(&self, label: String, op: impl FnOnce() -> Result<T>) -> Result<T> {
        self.calls.lock().push(label);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(reason) = self.fail_gatt.lock().clone() {
            return Err(Error::OperationFailed {
                operation: "fake",
                reason,
            });
        }
        op()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn adapter_state(&self) -> RadioState {
        *self.state.lock()
    }

    fn events(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, _filter: &[Uuid]) -> Result<()> {
        self.start_scan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.connect_mode.lock();
        match mode {
            ConnectMode::Succeed => self.peer(peer).map(|_| ()),
            ConnectMode::Fail => Err(Error::ConnectFailed {
                reason: "peer refused".to_string(),
            }),
            ConnectMode::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.drop_link(peer);
        Ok(())
    }

    async fn discover_services(
        &self,
        peer: &PeerId,
        filter: &[Uuid],
    ) -> Result<Vec<ServiceDescriptor>> {
        let known = self.peer(peer)?;
        self.gatt("discover services".to_string(), || {
            Ok(known
                .services
                .into_iter()
                .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
                .collect())
        })
        .await
    }

    async fn discover_characteristics(
        &self,
        peer: &PeerId,
        service: &Uuid,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicDescriptor>> {
        let known = self.peer(peer)?;
        self.gatt(format!("discover characteristics {service}"), || {
            Ok(known
                .characteristics
                .into_iter()
                .filter(|c| c.service_uuid == *service)
                .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
                .collect())
        })
        .await
    }

    async fn read(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Bytes> {
        let key = (peer.clone(), characteristic.uuid);
        self.gatt(format!("read {}", characteristic.uuid), || {
            Ok(self.values.lock().get(&key).cloned().unwrap_or_default())
        })
        .await
    }

    async fn write(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        _ack_required: bool,
    ) -> Result<()> {
        let key = (peer.clone(), characteristic.uuid);
        let value = Bytes::copy_from_slice(value);
        self.gatt(format!("write {}", characteristic.uuid), || {
            self.values.lock().insert(key, value);
            Ok(())
        })
        .await
    }

    async fn subscribe(
        &self,
        _peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<()> {
        self.gatt(format!("subscribe {}", characteristic.uuid), || Ok(()))
            .await
    }

    async fn unsubscribe(
        &self,
        _peer: &PeerId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<()> {
        self.gatt(format!("unsubscribe {}", characteristic.uuid), || Ok(()))
            .await
    }
}
