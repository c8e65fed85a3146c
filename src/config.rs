//! Configuration for the central manager and its sessions.

use std::time::Duration;

/// Timeouts and channel sizes used by [`CentralManager`](crate::CentralManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// Duration of a scan started with [`CentralManager::scan_for`](crate::CentralManager::scan_for)'s default.
    pub scan_timeout: Duration,
    /// Default connect timeout.
    pub connect_timeout: Duration,
    /// Default timeout for each GATT operation and for disconnect confirmation.
    pub operation_timeout: Duration,
    /// Capacity of the broadcast channels for scan and connection events.
    /// Values below 1 are treated as 1.
    pub event_capacity: usize,
}

impl CentralConfig {
    /// Default scan duration (10 seconds).
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default connect timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default GATT operation timeout (10 seconds).
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default event channel capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default scan duration.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the default connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default GATT operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the event channel capacity (at least 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Self::DEFAULT_SCAN_TIMEOUT,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}
