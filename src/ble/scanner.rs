//! BLE scanning functionality.
//!
//! A scan session runs in its own task. It feeds advertisements into a
//! registry of discovered devices until the timeout elapses, it is stopped,
//! its handle is dropped or the radio goes away. Whatever ends the session,
//! the transport scan is stopped exactly once and the final snapshot is
//! delivered exactly once.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::{Advertisement, DiscoveredDevice, PeerId};
use crate::ble::radio::RadioState;
use crate::callback::CallbackHandle;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

/// Devices seen during one scan session, in order of first sighting.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    order: Vec<PeerId>,
    devices: HashMap<PeerId, DiscoveredDevice>,
}

impl DeviceRegistry {
    /// Insert or supersede the entry for the advertising peer.
    pub(crate) fn upsert(&mut self, adv: Advertisement) -> DiscoveredDevice {
        let seen_at = Utc::now();
        match self.devices.get_mut(&adv.peer) {
            Some(device) => {
                device.update(adv, seen_at);
                device.clone()
            }
            None => {
                let device = DiscoveredDevice::from_advertisement(adv, seen_at);
                debug!("Discovered {} ({})", device.display_name(), device.id);
                self.order.push(device.id.clone());
                self.devices.insert(device.id.clone(), device.clone());
                device
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.devices.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

type ScanOutcome = Result<Vec<DiscoveredDevice>>;

struct ScanState {
    /// Stop signal of the active session, `None` when idle.
    active: Mutex<Option<(u64, mpsc::Sender<()>)>>,
    registry: Mutex<DeviceRegistry>,
    scanning_tx: watch::Sender<bool>,
    next_id: Mutex<u64>,
}

impl ScanState {
    fn finish(&self, scan_id: u64) {
        let mut active = self.active.lock();
        if active.as_ref().map(|(id, _)| *id) == Some(scan_id) {
            *active = None;
            self.scanning_tx.send_replace(false);
        }
    }
}

/// Handle to a running scan session.
///
/// Dropping the handle stops the scan.
#[derive(Debug)]
pub struct ScanHandle {
    stop_tx: mpsc::Sender<()>,
    outcome: Option<oneshot::Receiver<ScanOutcome>>,
}

impl ScanHandle {
    /// Ask the session to stop. The snapshot is still delivered by
    /// [`results`](Self::results).
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Wait for the session to end and return the discovered devices in
    /// order of first sighting.
    ///
    /// Fails with [`Error::RadioUnavailable`] if the radio went away while
    /// scanning.
    pub async fn results(mut self) -> Result<Vec<DiscoveredDevice>> {
        match self.outcome.take() {
            Some(outcome) => outcome.await.unwrap_or(Err(Error::Cancelled)),
            None => Err(Error::Cancelled),
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        if self.outcome.is_some() {
            self.stop();
        }
    }
}

/// BLE scanner.
pub struct Scanner {
    /// The transport to scan with.
    transport: Arc<dyn Transport>,
    /// Radio state from the central's monitor.
    radio: watch::Receiver<RadioState>,
    /// Active session and registry, shared with the scan task.
    state: Arc<ScanState>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<DiscoveredDevice>,
}

impl Scanner {
    /// Create a scanner.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        radio: watch::Receiver<RadioState>,
        event_capacity: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        let (scanning_tx, _) = watch::channel(false);

        Self {
            transport,
            radio,
            state: Arc::new(ScanState {
                active: Mutex::new(None),
                registry: Mutex::new(DeviceRegistry::default()),
                scanning_tx,
                next_id: Mutex::new(0),
            }),
            event_tx,
        }
    }

    /// Start a scan session.
    ///
    /// With a filter, only advertisements listing at least one of the given
    /// services are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if the radio is not powered on
    /// and [`Error::ScanAlreadyInProgress`] if a session is active.
    pub async fn start_scan(
        &self,
        timeout: Duration,
        filter: Option<Vec<Uuid>>,
    ) -> Result<ScanHandle> {
        if !self.radio.borrow().is_powered_on() {
            return Err(Error::AdapterUnavailable);
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let scan_id = {
            let mut active = self.state.active.lock();
            if active.is_some() {
                return Err(Error::ScanAlreadyInProgress);
            }
            let mut next_id = self.state.next_id.lock();
            *next_id += 1;
            *active = Some((*next_id, stop_tx.clone()));
            self.state.scanning_tx.send_replace(true);
            *next_id
        };
        self.state.registry.lock().clear();

        let filter = filter.unwrap_or_default();
        info!(
            "Starting BLE scan for {:?} ({} service filter)",
            timeout,
            filter.len()
        );

        // Subscribe before starting so no early advertisement is missed.
        let events = self.transport.events();
        if let Err(e) = self.transport.start_scan(&filter).await {
            warn!("Failed to start scan: {}", e);
            self.state.finish(scan_id);
            return Err(e);
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(Self::run(
            scan_id,
            self.transport.clone(),
            self.state.clone(),
            self.event_tx.clone(),
            events,
            filter,
            timeout,
            stop_rx,
            outcome_tx,
        ));

        Ok(ScanHandle {
            stop_tx,
            outcome: Some(outcome_rx),
        })
    }

    /// Stop the active scan session, if any, and wait until it has ended.
    pub async fn stop_scan(&self) {
        let stop_tx = self.state.active.lock().as_ref().map(|(_, tx)| tx.clone());
        let Some(stop_tx) = stop_tx else {
            debug!("Not scanning, ignoring stop request");
            return;
        };

        let _ = stop_tx.try_send(());
        let mut scanning = self.state.scanning_tx.subscribe();
        let _ = scanning.wait_for(|active| !*active).await.map(|_| ());
    }

    /// Check if a scan session is active.
    pub fn is_scanning(&self) -> bool {
        *self.state.scanning_tx.borrow()
    }

    /// Devices seen so far by the active session, in order of first
    /// sighting. Empty once the session has ended.
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.state.registry.lock().snapshot()
    }

    /// Subscribe to discovery updates.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.event_tx.subscribe()
    }

    /// Register a callback for discovered or updated devices.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DiscoveredDevice) + Send + Sync + 'static,
    {
        CallbackHandle::spawn_listener(self.event_tx.subscribe(), callback)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        scan_id: u64,
        transport: Arc<dyn Transport>,
        state: Arc<ScanState>,
        event_tx: broadcast::Sender<DiscoveredDevice>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        filter: Vec<Uuid>,
        timeout: Duration,
        mut stop_rx: mpsc::Receiver<()>,
        outcome_tx: oneshot::Sender<ScanOutcome>,
    ) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let ended: Result<()> = loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Scan timed out");
                    break Ok(());
                }
                _ = stop_rx.recv() => {
                    debug!("Scan stopped");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Advertisement(adv)) => {
                        if !filter.is_empty() && !adv.data.advertises_any(&filter) {
                            trace!("Ignoring advertisement from {}", adv.peer);
                            continue;
                        }
                        let device = state.registry.lock().upsert(adv);
                        let _ = event_tx.send(device);
                    }
                    Some(TransportEvent::StateChanged(radio)) if !radio.is_powered_on() => {
                        warn!("Radio {} while scanning", radio);
                        break Err(Error::RadioUnavailable);
                    }
                    Some(_) => {}
                    None => break Err(Error::RadioUnavailable),
                },
            }
        };

        if let Err(e) = transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let devices = {
            let mut registry = state.registry.lock();
            let devices = registry.snapshot();
            registry.clear();
            devices
        };
        info!("Scan ended with {} devices", devices.len());
        state.finish(scan_id);

        let outcome = ended.map(|_| devices);
        if outcome_tx.send(outcome).is_err() {
            trace!("Scan handle dropped before results were collected");
        }
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("is_scanning", &self.is_scanning())
            .field("discovered", &self.state.registry.lock().len())
            .finish()
    }
}
