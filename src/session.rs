//! Device session.
//!
//! A [`DeviceSession`] owns everything about one remote peer: the
//! connection state machine, the descriptor cache, the GATT operation queue
//! and the active notification subscriptions. Application code can only
//! request transitions; the state itself changes in response to transport
//! completions and events.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::PeerId;
use crate::ble::characteristics::{
    CharacteristicDescriptor, DescriptorCache, GattOperation, ServiceDescriptor,
};
use crate::ble::connection::{ConnectionEvent, ConnectionState, DisconnectReason};
use crate::ble::queue::{OperationKind, OperationQueue, OperationRequest};
use crate::ble::radio::RadioState;
use crate::ble::subscription::{CharacteristicKey, NotificationStream, SubscriptionSet};
use crate::ble::uuids::parse_uuid;
use crate::callback::CallbackHandle;
use crate::config::CentralConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

/// State guarded by the session lock.
#[derive(Default)]
struct SessionShared {
    /// Bumped on every connect and every teardown, so results belonging
    /// to an earlier connection are never applied to the cache.
    generation: u64,
    cache: DescriptorCache,
    subscriptions: SubscriptionSet,
}

/// A connection to one remote peer.
pub struct DeviceSession {
    /// Peer identifier.
    peer: PeerId,
    /// Transport used for every request.
    transport: Arc<dyn Transport>,
    /// Radio state from the central's monitor.
    radio: watch::Receiver<RadioState>,
    /// Timeouts.
    config: CentralConfig,
    /// Current connection state.
    state_tx: watch::Sender<ConnectionState>,
    /// Descriptor cache, subscriptions and connection generation.
    shared: RwLock<SessionShared>,
    /// GATT operation queue.
    queue: OperationQueue,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Handle to the transport event task.
    event_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Weak self reference handed to notification streams.
    me: Weak<DeviceSession>,
}

impl DeviceSession {
    /// Create a session for `peer`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(
        peer: PeerId,
        transport: Arc<dyn Transport>,
        radio: watch::Receiver<RadioState>,
        config: CentralConfig,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let events = transport.events();

        let session = Arc::new_cyclic(|me| Self {
            queue: OperationQueue::new(transport.clone(), peer.clone()),
            peer,
            transport,
            radio,
            config,
            state_tx,
            shared: RwLock::new(SessionShared::default()),
            event_tx,
            event_handle: Mutex::new(None),
            me: me.clone(),
        });

        let handle = tokio::spawn(Self::process_events(Arc::downgrade(&session), events));
        *session.event_handle.lock() = Some(handle);

        session
    }

    // === Identification & state ===

    /// Get the peer identifier.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to connection events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        CallbackHandle::spawn_listener(self.event_tx.subscribe(), callback)
    }

    /// Number of active notification subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.read().subscriptions.len()
    }

    /// Check whether notifications from a characteristic are being delivered.
    pub fn is_subscribed(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.shared
            .read()
            .subscriptions
            .is_active(&(*service, *characteristic))
    }

    /// Number of GATT operations queued behind the in-flight one.
    pub fn queued_operations(&self) -> usize {
        self.queue.queued()
    }

    /// Kind of the GATT operation currently outstanding on the transport.
    pub fn operation_in_flight(&self) -> Option<OperationKind> {
        self.queue.in_flight()
    }

    // === Connection lifecycle ===

    /// Connect using the configured connect timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.config.connect_timeout).await
    }

    /// Connect to the peer.
    ///
    /// Only valid while disconnected. On failure or timeout the session is
    /// back in `Disconnected` and [`Error::ConnectFailed`] is returned.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_radio()?;

        {
            let _shared = self.shared.write();
            let current = self.state();
            if current != ConnectionState::Disconnected {
                return Err(Error::InvalidState {
                    operation: "connect",
                    state: current,
                });
            }
            self.transition(ConnectionState::Connecting, None);
        }

        info!("Connecting to {}", self.peer);

        let mut state_rx = self.state_tx.subscribe();
        let attempt = tokio::time::timeout(timeout, self.transport.connect(&self.peer));
        let left_connecting = async {
            let _ = state_rx
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|_| ());
        };

        let mut timed_out = false;
        let outcome = tokio::select! {
            result = attempt => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e @ Error::ConnectFailed { .. })) => Err(e),
                Ok(Err(e)) => Err(Error::ConnectFailed { reason: e.to_string() }),
                Err(_) => {
                    timed_out = true;
                    Err(Error::ConnectFailed {
                        reason: format!("timed out after {:?}", timeout),
                    })
                }
            },
            _ = left_connecting => Err(Error::ConnectFailed {
                reason: "connection attempt aborted".to_string(),
            }),
        };

        match outcome {
            Ok(()) => {
                let mut shared = self.shared.write();
                if self.state() != ConnectionState::Connecting {
                    return Err(Error::ConnectFailed {
                        reason: "connection attempt aborted".to_string(),
                    });
                }
                shared.generation += 1;
                shared.cache.clear();
                self.transition(ConnectionState::Connected, None);
                drop(shared);

                info!("Connected to {}", self.peer);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", self.peer, e);
                // A concurrent disconnect() finishes its own teardown.
                if self.state() == ConnectionState::Connecting {
                    self.teardown(
                        ConnectionState::Disconnected,
                        Some(DisconnectReason::ConnectFailed),
                        Error::SessionClosed,
                    );
                }

                if timed_out {
                    // The platform may still be trying; cancel the pending link.
                    let transport = self.transport.clone();
                    let peer = self.peer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.disconnect(&peer).await {
                            debug!("Cancelling connection to {} failed: {}", peer, e);
                        }
                    });
                }

                Err(e)
            }
        }
    }

    /// Disconnect from the peer.
    ///
    /// Outstanding operations resolve with [`Error::SessionClosed`] first,
    /// then subscriptions end and the descriptor cache is cleared. Calling
    /// this while already disconnected (or disconnecting) does nothing.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.teardown(
            ConnectionState::Disconnecting,
            None,
            Error::SessionClosed,
        ) {
            debug!("Disconnect of {} ignored in state {}", self.peer, self.state());
            return Ok(());
        }

        info!("Disconnecting from {}", self.peer);

        let result = tokio::time::timeout(
            self.config.operation_timeout,
            self.transport.disconnect(&self.peer),
        )
        .await;

        // The session ends up disconnected whatever the transport says.
        self.teardown(
            ConnectionState::Disconnected,
            Some(DisconnectReason::Requested),
            Error::SessionClosed,
        );

        match result {
            Ok(Ok(())) => {
                info!("Disconnected from {}", self.peer);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Transport disconnect of {} failed: {}", self.peer, e);
                Err(e)
            }
            Err(_) => {
                warn!("Transport disconnect of {} timed out", self.peer);
                Err(Error::OperationTimeout {
                    operation: "disconnect",
                })
            }
        }
    }

    // === Discovery ===

    /// Discover services, replacing the cached services in the discovered scope.
    ///
    /// `None` discovers all services.
    pub async fn discover_services(
        &self,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<ServiceDescriptor>> {
        let (rx, generation) = {
            let shared = self.shared.read();
            self.ensure_ready()?;
            let request = OperationRequest::DiscoverServices {
                filter: filter.map(<[Uuid]>::to_vec).unwrap_or_default(),
            };
            (
                self.queue
                    .enqueue(request, Some(self.config.operation_timeout)),
                shared.generation,
            )
        };

        let services = OperationQueue::completion(rx).await?.into_services()?;

        let mut shared = self.shared.write();
        if shared.generation != generation || !self.is_connected() {
            return Err(Error::SessionClosed);
        }
        shared.cache.replace_services(filter, &services);
        self.end_uncached_subscriptions(&mut shared);
        debug!("Discovered {} services on {}", services.len(), self.peer);

        Ok(services)
    }

    /// Discover characteristics of a cached service.
    ///
    /// `None` discovers all characteristics of the service.
    pub async fn discover_characteristics(
        &self,
        service: Uuid,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<CharacteristicDescriptor>> {
        let (rx, generation) = {
            let shared = self.shared.read();
            self.ensure_ready()?;
            if !shared.cache.has_service(&service) {
                return Err(Error::ServiceNotFound {
                    uuid: service.to_string(),
                });
            }
            let request = OperationRequest::DiscoverCharacteristics {
                service,
                filter: filter.map(<[Uuid]>::to_vec).unwrap_or_default(),
            };
            (
                self.queue
                    .enqueue(request, Some(self.config.operation_timeout)),
                shared.generation,
            )
        };

        let characteristics = OperationQueue::completion(rx)
            .await?
            .into_characteristics()?;

        let mut shared = self.shared.write();
        if shared.generation != generation || !self.is_connected() {
            return Err(Error::SessionClosed);
        }
        shared
            .cache
            .replace_characteristics(&service, filter, &characteristics)?;
        self.end_uncached_subscriptions(&mut shared);
        debug!(
            "Discovered {} characteristics in {} on {}",
            characteristics.len(),
            service,
            self.peer
        );

        Ok(characteristics)
    }

    /// Discover every service and then the characteristics of each.
    pub async fn discover_all(
        &self,
    ) -> Result<Vec<(ServiceDescriptor, Vec<CharacteristicDescriptor>)>> {
        let services = self.discover_services(None).await?;
        let mut discovered = Vec::with_capacity(services.len());
        for service in services {
            let characteristics = self.discover_characteristics(service.uuid, None).await?;
            discovered.push((service, characteristics));
        }
        Ok(discovered)
    }

    /// Cached services, in discovery order.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.shared.read().cache.services()
    }

    /// Cached characteristics of a service, `None` if not yet discovered.
    pub fn characteristics(&self, service: &Uuid) -> Option<Vec<CharacteristicDescriptor>> {
        self.shared.read().cache.characteristics(service)
    }

    /// Look up a cached characteristic.
    pub fn characteristic(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<CharacteristicDescriptor> {
        self.shared.read().cache.characteristic(service, characteristic)
    }

    // === GATT operations ===

    /// Read a characteristic value using the configured operation timeout.
    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        self.read_with_timeout(service, characteristic, self.config.operation_timeout)
            .await
    }

    /// Read a characteristic value.
    pub async fn read_with_timeout(
        &self,
        service: Uuid,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<Bytes> {
        let rx = {
            let shared = self.shared.read();
            let descriptor =
                self.validate(&shared, &service, &characteristic, GattOperation::Read)?;
            self.queue.enqueue(
                OperationRequest::Read {
                    characteristic: descriptor,
                },
                Some(timeout),
            )
        };

        let value = OperationQueue::completion(rx).await?.into_value()?;
        trace!("Read {} bytes from characteristic {}", value.len(), characteristic);

        Ok(value)
    }

    /// Write a characteristic value using the configured operation timeout.
    ///
    /// With `ack_required` the characteristic must support write with
    /// response, otherwise write without response.
    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
        ack_required: bool,
    ) -> Result<()> {
        self.write_with_timeout(
            service,
            characteristic,
            value,
            ack_required,
            self.config.operation_timeout,
        )
        .await
    }

    /// Write a characteristic value.
    pub async fn write_with_timeout(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
        ack_required: bool,
        timeout: Duration,
    ) -> Result<()> {
        let value = value.into();
        let operation = if ack_required {
            GattOperation::Write
        } else {
            GattOperation::WriteWithoutResponse
        };
        let len = value.len();

        let rx = {
            let shared = self.shared.read();
            let descriptor = self.validate(&shared, &service, &characteristic, operation)?;
            self.queue.enqueue(
                OperationRequest::Write {
                    characteristic: descriptor,
                    value,
                    ack_required,
                },
                Some(timeout),
            )
        };

        OperationQueue::completion(rx).await?;
        trace!("Wrote {} bytes to characteristic {}", len, characteristic);

        Ok(())
    }

    /// Subscribe to notifications (or indications) from a characteristic.
    ///
    /// The subscription is registered before the request is sent, so no
    /// value the peer sends right after enabling is lost. Subscribing again
    /// replaces the previous stream.
    pub async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let key: CharacteristicKey = (service, characteristic);

        let (rx, token, stream) = {
            let mut shared = self.shared.write();
            let descriptor = shared.cache.characteristic(&service, &characteristic)?;
            if !descriptor.properties.can_subscribe() {
                return Err(Error::UnsupportedOperation {
                    operation: GattOperation::Notify.name(),
                    uuid: characteristic.to_string(),
                });
            }
            self.ensure_ready()?;

            let (token, receiver, backlog) = shared.subscriptions.insert(descriptor.clone());
            let me = self.me.clone();
            let stream = NotificationStream::new(&descriptor, receiver, backlog, move || {
                if let Some(session) = me.upgrade() {
                    session.release_subscription(&key, token);
                }
            });
            let rx = self.queue.enqueue(
                OperationRequest::Subscribe {
                    characteristic: descriptor,
                },
                Some(self.config.operation_timeout),
            );
            (rx, token, stream)
        };

        debug!("Subscribing to {} on {}", characteristic, self.peer);

        if let Err(e) = OperationQueue::completion(rx).await {
            self.shared
                .write()
                .subscriptions
                .remove_if_current(&key, token);
            return Err(e);
        }

        Ok(stream)
    }

    /// Unsubscribe from a characteristic.
    ///
    /// Delivery stops immediately, before the request reaches the transport.
    pub async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let rx = {
            let mut shared = self.shared.write();
            let descriptor = shared.cache.characteristic(&service, &characteristic)?;
            if !descriptor.properties.can_subscribe() {
                return Err(Error::UnsupportedOperation {
                    operation: GattOperation::Notify.name(),
                    uuid: characteristic.to_string(),
                });
            }
            self.ensure_ready()?;

            shared.subscriptions.remove(&(service, characteristic));
            self.queue.enqueue(
                OperationRequest::Unsubscribe {
                    characteristic: descriptor,
                },
                Some(self.config.operation_timeout),
            )
        };

        OperationQueue::completion(rx).await?;
        debug!("Unsubscribed from {} on {}", characteristic, self.peer);

        Ok(())
    }

    // === String-addressed helpers ===

    /// [`read`](Self::read) with UUIDs given as strings.
    pub async fn read_str(&self, service: &str, characteristic: &str) -> Result<Bytes> {
        self.read(parse_uuid(service)?, parse_uuid(characteristic)?)
            .await
    }

    /// [`write`](Self::write) with UUIDs given as strings.
    pub async fn write_str(
        &self,
        service: &str,
        characteristic: &str,
        value: impl Into<Bytes>,
        ack_required: bool,
    ) -> Result<()> {
        self.write(
            parse_uuid(service)?,
            parse_uuid(characteristic)?,
            value,
            ack_required,
        )
        .await
    }

    /// [`subscribe`](Self::subscribe) with UUIDs given as strings.
    pub async fn subscribe_str(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<NotificationStream> {
        self.subscribe(parse_uuid(service)?, parse_uuid(characteristic)?)
            .await
    }

    // === Internals ===

    fn ensure_radio(&self) -> Result<()> {
        if self.radio.borrow().is_powered_on() {
            Ok(())
        } else {
            Err(Error::AdapterUnavailable)
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.ensure_radio()
    }

    fn validate(
        &self,
        shared: &SessionShared,
        service: &Uuid,
        characteristic: &Uuid,
        operation: GattOperation,
    ) -> Result<CharacteristicDescriptor> {
        let descriptor = shared.cache.characteristic(service, characteristic)?;
        descriptor.require(operation)?;
        self.ensure_ready()?;
        Ok(descriptor)
    }

    /// Move to `next` and emit an event. Returns `false` for an illegal
    /// transition, leaving the state unchanged.
    fn transition(&self, next: ConnectionState, reason: Option<DisconnectReason>) -> bool {
        let mut previous = next;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = *state;
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(
                "Connection state of {} changed: {} -> {}",
                self.peer, previous, next
            );
            let _ = self.event_tx.send(ConnectionEvent {
                peer: self.peer.clone(),
                state: next,
                reason,
            });
        }

        changed
    }

    /// Transition towards disconnected and release everything tied to the
    /// connection: outstanding operations are resolved with `error`, then
    /// subscriptions end. Returns `false` if the transition was illegal.
    fn teardown(
        &self,
        next: ConnectionState,
        reason: Option<DisconnectReason>,
        error: Error,
    ) -> bool {
        let subscriptions = {
            let mut shared = self.shared.write();
            if !self.transition(next, reason) {
                return false;
            }
            shared.generation += 1;
            if !shared.cache.is_empty() {
                trace!("Clearing descriptor cache of {}", self.peer);
                shared.cache.clear();
            }
            shared.subscriptions.take_all()
        };

        self.queue.abort_all(error);

        if !subscriptions.is_empty() {
            debug!(
                "Ended {} subscriptions on {}",
                subscriptions.len(),
                self.peer
            );
        }
        drop(subscriptions);

        true
    }

    /// Called when a notification stream is dropped.
    fn release_subscription(&self, key: &CharacteristicKey, token: u64) {
        let mut shared = self.shared.write();
        let Some(subscription) = shared.subscriptions.remove_if_current(key, token) else {
            return;
        };
        if !self.is_connected() {
            return;
        }

        trace!("Notification stream for {} dropped, unsubscribing", key.1);
        self.queue.submit_detached(
            OperationRequest::Unsubscribe {
                characteristic: subscription.characteristic().clone(),
            },
            Some(self.config.operation_timeout),
        );
    }

    /// End subscriptions whose characteristic is no longer cached after a
    /// rediscovery, and disable them on the peer.
    fn end_uncached_subscriptions(&self, shared: &mut SessionShared) {
        let SessionShared {
            cache,
            subscriptions,
            ..
        } = shared;
        let ended = subscriptions.take_where(|(service, characteristic)| {
            cache.characteristic(service, characteristic).is_err()
        });

        for subscription in ended {
            debug!(
                "Characteristic {} left the cache of {}, ending its subscription",
                subscription.characteristic().uuid,
                self.peer
            );
            self.queue.submit_detached(
                OperationRequest::Unsubscribe {
                    characteristic: subscription.characteristic().clone(),
                },
                Some(self.config.operation_timeout),
            );
        }
    }

    fn handle_link_down(&self, error: Error) {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!("Link to {} lost ({})", self.peer, error);
                self.teardown(
                    ConnectionState::Disconnected,
                    Some(DisconnectReason::LinkLost),
                    error,
                );
            }
            // A requested disconnect is finished by `disconnect()` itself.
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                trace!("Ignoring link-down for {} in state {}", self.peer, self.state());
            }
        }
    }

    fn route_notification(&self, service: Uuid, characteristic: Uuid, value: Bytes) {
        let shared = self.shared.read();
        if !shared.subscriptions.deliver(&(service, characteristic), value) {
            trace!(
                "Dropping notification from {} on {}: not subscribed",
                characteristic,
                self.peer
            );
        }
    }

    async fn process_events(
        session: Weak<DeviceSession>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };

            match event {
                TransportEvent::Disconnected { peer } if peer == session.peer => {
                    session.handle_link_down(Error::SessionClosed);
                }
                TransportEvent::StateChanged(state) if !state.is_powered_on() => {
                    session.handle_link_down(Error::RadioUnavailable);
                }
                TransportEvent::Notification {
                    peer,
                    service,
                    characteristic,
                    value,
                } if peer == session.peer => {
                    session.route_notification(service, characteristic, value);
                }
                _ => {}
            }
        }

        trace!("Session event task ended");
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(handle) = self.event_handle.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
