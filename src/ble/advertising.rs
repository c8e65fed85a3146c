//! Advertisement and discovered-device types.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Stable (per adapter session) identifier of a remote peer.
///
/// The value is whatever the platform uses: a MAC address on Linux and
/// Windows, a UUID on Apple platforms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Raw advertisement payload, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Bytes>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Bytes>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
}

impl AdvertisementData {
    /// Check whether any of `filter` is advertised, either in the service
    /// list or as a service data key.
    pub fn advertises_any(&self, filter: &[Uuid]) -> bool {
        filter
            .iter()
            .any(|uuid| self.services.contains(uuid) || self.service_data.contains_key(uuid))
    }
}

/// A single advertisement sighting reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// The advertising peer.
    pub peer: PeerId,
    /// Local name, if the packet carried one.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertisement payload.
    pub data: AdvertisementData,
}

/// A device seen during a scan session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Peer identifier.
    pub id: PeerId,
    /// Advertised name.
    pub name: Option<String>,
    /// Most recent advertisement payload.
    pub advertisement: AdvertisementData,
    /// Time of the most recent sighting.
    pub last_seen: DateTime<Utc>,
    /// Signal strength of the most recent sighting in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a device entry from its first sighting.
    pub fn from_advertisement(adv: Advertisement, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: adv.peer,
            name: adv.local_name,
            advertisement: adv.data,
            last_seen: seen_at,
            rssi: adv.rssi,
        }
    }

    /// Supersede this entry with a newer sighting.
    ///
    /// A sighting without a name (e.g. a bare advertisement following a
    /// scan response) keeps the previously known name.
    pub fn update(&mut self, adv: Advertisement, seen_at: DateTime<Utc>) {
        if adv.local_name.is_some() {
            self.name = adv.local_name;
        }
        self.advertisement = adv.data;
        self.rssi = adv.rssi;
        self.last_seen = seen_at;
    }

    /// Display name, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::BATTERY_SERVICE_UUID;

    fn sighting(name: Option<&str>, rssi: i16) -> Advertisement {
        Advertisement {
            peer: PeerId::new("AA:BB:CC:DD:EE:FF"),
            local_name: name.map(str::to_string),
            rssi: Some(rssi),
            data: AdvertisementData::default(),
        }
    }

    #[test]
    fn test_update_keeps_name_when_missing() {
        let t0 = Utc::now();
        let mut device = DiscoveredDevice::from_advertisement(sighting(Some("Robot"), -70), t0);
        let t1 = t0 + chrono::Duration::milliseconds(250);
        device.update(sighting(None, -55), t1);

        assert_eq!(device.name.as_deref(), Some("Robot"));
        assert_eq!(device.rssi, Some(-55));
        assert_eq!(device.last_seen, t1);
    }

    #[test]
    fn test_display_name_fallback() {
        let device = DiscoveredDevice::from_advertisement(sighting(None, -70), Utc::now());
        assert_eq!(device.display_name(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_advertises_any() {
        let mut data = AdvertisementData::default();
        assert!(!data.advertises_any(&[BATTERY_SERVICE_UUID]));
        data.service_data
            .insert(BATTERY_SERVICE_UUID, Bytes::from_static(&[100]));
        assert!(data.advertises_any(&[BATTERY_SERVICE_UUID]));
    }
}
