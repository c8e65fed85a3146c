//! Central manager.
//!
//! Entry point of the library. Owns the radio monitor, the scanner and one
//! [`DeviceSession`] per peer, all sharing a single transport.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ble::advertising::{DiscoveredDevice, PeerId};
use crate::ble::radio::{RadioMonitor, RadioState};
use crate::ble::scanner::Scanner;
use crate::config::CentralConfig;
use crate::error::Result;
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Central manager for discovering and connecting to BLE peripherals.
pub struct CentralManager {
    /// Platform transport.
    transport: Arc<dyn Transport>,
    /// Timeouts and channel sizes.
    config: CentralConfig,
    /// Radio state tracking.
    radio: RadioMonitor,
    /// Scanner.
    scanner: Scanner,
    /// Sessions by peer identifier.
    sessions: RwLock<HashMap<PeerId, Arc<DeviceSession>>>,
}

impl CentralManager {
    /// Create a central manager on top of `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: CentralConfig) -> Self {
        let radio = RadioMonitor::new(&transport);
        let scanner = Scanner::new(transport.clone(), radio.watch(), config.event_capacity);

        Self {
            transport,
            config,
            radio,
            scanner,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a central manager using the first Bluetooth adapter of the
    /// platform.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    #[cfg(feature = "btleplug")]
    pub async fn with_btleplug(config: CentralConfig) -> Result<Self> {
        let transport = crate::transport::BtleplugTransport::new().await?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Get the configuration.
    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Get the radio monitor.
    pub fn radio(&self) -> &RadioMonitor {
        &self.radio
    }

    /// Get the current radio state.
    pub fn radio_state(&self) -> RadioState {
        self.radio.current_state()
    }

    /// Get the scanner.
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Scan for `timeout` and return the devices seen, in order of first
    /// sighting.
    pub async fn scan_for(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.scanner.start_scan(timeout, None).await?.results().await
    }

    /// Scan for the configured default duration.
    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        self.scan_for(self.config.scan_timeout).await
    }

    /// Get the session for a peer, creating it on first use.
    ///
    /// The same session is returned for the same peer for the lifetime of
    /// the manager, so it can be connected and disconnected repeatedly.
    pub fn session(&self, peer: impl Into<PeerId>) -> Arc<DeviceSession> {
        let peer = peer.into();
        if let Some(session) = self.sessions.read().get(&peer) {
            return session.clone();
        }

        self.sessions
            .write()
            .entry(peer.clone())
            .or_insert_with(|| {
                debug!("Creating session for {}", peer);
                DeviceSession::new(
                    peer.clone(),
                    self.transport.clone(),
                    self.radio.watch(),
                    self.config.clone(),
                )
            })
            .clone()
    }

    /// Get the session for a discovered device.
    pub fn session_for(&self, device: &DiscoveredDevice) -> Arc<DeviceSession> {
        self.session(device.id.clone())
    }

    /// Get all sessions created so far.
    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Get the sessions that are currently connected.
    pub fn connected_sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_connected())
            .cloned()
            .collect()
    }

    /// Stop scanning and disconnect every session.
    ///
    /// Disconnect failures are logged; every session still ends up
    /// disconnected.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down central manager");

        self.scanner.stop_scan().await;

        for session in self.sessions() {
            if let Err(e) = session.disconnect().await {
                warn!("Error disconnecting {}: {}", session.peer(), e);
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralManager")
            .field("radio", &self.radio_state())
            .field("scanner", &self.scanner)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}
