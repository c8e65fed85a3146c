//! Radio (adapter power) state tracking.
//!
//! The monitor relays transport state events into a `watch` channel so
//! every component can check the current state without awaiting.

use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::callback::CallbackHandle;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

/// Power/availability state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// State not yet reported by the platform.
    #[default]
    Unknown,
    /// The adapter is resetting.
    Resetting,
    /// The platform has no BLE central support.
    Unsupported,
    /// The application is not permitted to use Bluetooth.
    Unauthorized,
    /// Bluetooth is switched off.
    PoweredOff,
    /// Bluetooth is on and usable.
    PoweredOn,
}

impl RadioState {
    /// Check if the adapter accepts requests.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "Powered Off"),
            Self::PoweredOn => write!(f, "Powered On"),
        }
    }
}

/// Tracks the adapter's radio state.
pub struct RadioMonitor {
    state_tx: Arc<watch::Sender<RadioState>>,
    relay_handle: tokio::task::JoinHandle<()>,
}

impl RadioMonitor {
    /// Start monitoring the given transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: &Arc<dyn Transport>) -> Self {
        // Subscribe before sampling so a change in between is not lost.
        let events = transport.events();
        let initial = transport.adapter_state();
        info!("Radio state at startup: {}", initial);

        let (state_tx, _) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);
        let relay_handle = tokio::spawn(Self::relay(events, state_tx.clone()));

        Self {
            state_tx,
            relay_handle,
        }
    }

    async fn relay(
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        state_tx: Arc<watch::Sender<RadioState>>,
    ) {
        while let Some(event) = events.recv().await {
            if let TransportEvent::StateChanged(state) = event {
                let previous = state_tx.send_replace(state);
                if previous != state {
                    info!("Radio state changed: {} -> {}", previous, state);
                }
            }
        }

        debug!("Radio monitor relay ended");
    }

    /// Get the current radio state.
    pub fn current_state(&self) -> RadioState {
        *self.state_tx.borrow()
    }

    /// Fail fast with [`Error::AdapterUnavailable`] unless powered on.
    pub fn ensure_powered_on(&self) -> Result<()> {
        if self.current_state().is_powered_on() {
            Ok(())
        } else {
            Err(Error::AdapterUnavailable)
        }
    }

    /// Get a watch receiver for the radio state.
    pub fn watch(&self) -> watch::Receiver<RadioState> {
        self.state_tx.subscribe()
    }

    /// Stream of radio states.
    ///
    /// Nothing happens until the stream is polled. It yields the current
    /// state first and then every change, and never ends while the monitor
    /// is alive. Each call returns an independent stream.
    pub fn state_changes(&self) -> impl Stream<Item = RadioState> + Send + 'static {
        let rx = self.state_tx.subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let state = *rx.borrow_and_update();
            Some((state, (rx, false)))
        })
    }

    /// Register a callback for radio state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(RadioState) + Send + Sync + 'static,
    {
        let mut rx = self.state_tx.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                callback(state);
            }
        });

        CallbackHandle::new(move || handle.abort())
    }
}

impl Drop for RadioMonitor {
    fn drop(&mut self) {
        self.relay_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_radio_state() {
        assert!(RadioState::PoweredOn.is_powered_on());
        assert!(!RadioState::PoweredOff.is_powered_on());
        assert_eq!(RadioState::default(), RadioState::Unknown);
        assert_eq!(format!("{}", RadioState::PoweredOff), "Powered Off");
    }

    #[tokio::test]
    async fn test_monitor_tracks_transport() {
        let fake = FakeTransport::new();
        let transport: Arc<dyn Transport> = fake.clone();
        let monitor = RadioMonitor::new(&transport);
        assert_eq!(monitor.current_state(), RadioState::PoweredOn);
        assert!(monitor.ensure_powered_on().is_ok());

        fake.set_radio_state(RadioState::PoweredOff);
        let mut rx = monitor.watch();
        rx.wait_for(|s| *s == RadioState::PoweredOff).await.unwrap();
        assert!(matches!(
            monitor.ensure_powered_on(),
            Err(Error::AdapterUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_power_off_survives_advertisement_burst() {
        let fake = FakeTransport::new();
        let transport: Arc<dyn Transport> = fake.clone();
        let monitor = RadioMonitor::new(&transport);

        fake.set_radio_state(RadioState::PoweredOff);
        for i in 0..300 {
            fake.advertise(&format!("dev-{i}"), None, -60, &[]);
        }

        let mut rx = monitor.watch();
        tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| *s == RadioState::PoweredOff),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(monitor.current_state(), transport.adapter_state());
    }

    #[tokio::test]
    async fn test_state_changes_is_restartable() {
        let fake = FakeTransport::new();
        let transport: Arc<dyn Transport> = fake.clone();
        let monitor = RadioMonitor::new(&transport);

        let first: Vec<_> = monitor.state_changes().take(1).collect().await;
        assert_eq!(first, vec![RadioState::PoweredOn]);

        let mut changes = Box::pin(monitor.state_changes());
        assert_eq!(changes.next().await, Some(RadioState::PoweredOn));

        fake.set_radio_state(RadioState::Resetting);
        let next = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap();
        assert_eq!(next, Some(RadioState::Resetting));

        // A fresh stream starts from the current state.
        let again: Vec<_> = monitor.state_changes().take(1).collect().await;
        assert_eq!(again, vec![RadioState::Resetting]);
    }

    #[tokio::test]
    async fn test_on_state_changed_callback() {
        let fake = FakeTransport::new();
        let transport: Arc<dyn Transport> = fake.clone();
        let monitor = RadioMonitor::new(&transport);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = monitor.on_state_changed(move |state| {
            let _ = tx.send(state);
        });
        tokio::task::yield_now().await;

        fake.set_radio_state(RadioState::Unauthorized);
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(seen, Some(RadioState::Unauthorized));
    }
}
