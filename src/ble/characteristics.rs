//! GATT service and characteristic descriptors.
//!
//! Provides the descriptor types returned by discovery and the per-session
//! cache that every read/write/subscribe request is validated against.

use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A GATT operation a characteristic may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GattOperation {
    /// Read the value.
    Read,
    /// Write with response (acknowledged).
    Write,
    /// Write without response.
    WriteWithoutResponse,
    /// Notifications.
    Notify,
    /// Indications (acknowledged notifications).
    Indicate,
}

impl GattOperation {
    /// Name used in log messages and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::WriteWithoutResponse => "write without response",
            Self::Notify => "notify",
            Self::Indicate => "indicate",
        }
    }
}

/// Set of operations supported by a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Read is supported.
    pub const READ: Self = Self(0x01);
    /// Write with response is supported.
    pub const WRITE: Self = Self(0x02);
    /// Write without response is supported.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Notifications are supported.
    pub const NOTIFY: Self = Self(0x08);
    /// Indications are supported.
    pub const INDICATE: Self = Self(0x10);

    /// No operations.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether a specific operation is supported.
    pub fn supports(&self, operation: GattOperation) -> bool {
        match operation {
            GattOperation::Read => self.contains(Self::READ),
            GattOperation::Write => self.contains(Self::WRITE),
            GattOperation::WriteWithoutResponse => self.contains(Self::WRITE_WITHOUT_RESPONSE),
            GattOperation::Notify => self.contains(Self::NOTIFY),
            GattOperation::Indicate => self.contains(Self::INDICATE),
        }
    }

    /// Check whether the characteristic can stream values (notify or indicate).
    pub fn can_subscribe(&self) -> bool {
        self.supports(GattOperation::Notify) || self.supports(GattOperation::Indicate)
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
}

impl CharacteristicDescriptor {
    /// Fail with [`Error::UnsupportedOperation`] unless `operation` is supported.
    pub fn require(&self, operation: GattOperation) -> Result<()> {
        if self.properties.supports(operation) {
            Ok(())
        } else {
            Err(Error::UnsupportedOperation {
                operation: operation.name(),
                uuid: self.uuid.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    descriptor: ServiceDescriptor,
    /// `None` until characteristic discovery for this service completed.
    characteristics: Option<Vec<CharacteristicDescriptor>>,
}

/// Descriptor cache for one device session.
#[derive(Debug, Default)]
pub(crate) struct DescriptorCache {
    services: HashMap<Uuid, ServiceEntry>,
    /// Service UUIDs in discovery order.
    order: Vec<Uuid>,
}

impl DescriptorCache {
    pub(crate) fn clear(&mut self) {
        self.services.clear();
        self.order.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Replace cached services for the discovered scope.
    ///
    /// Without a filter the whole cache is replaced. With a filter only the
    /// filtered UUIDs are dropped and re-inserted. A replaced service loses
    /// its cached characteristics.
    pub(crate) fn replace_services(
        &mut self,
        filter: Option<&[Uuid]>,
        discovered: &[ServiceDescriptor],
    ) {
        match filter {
            None => self.clear(),
            Some(uuids) => {
                self.services.retain(|uuid, _| !uuids.contains(uuid));
                self.order.retain(|uuid| !uuids.contains(uuid));
            }
        }

        for service in discovered {
            if let Some(uuids) = filter {
                if !uuids.contains(&service.uuid) {
                    continue;
                }
            }
            if self.services.contains_key(&service.uuid) {
                continue;
            }
            self.order.push(service.uuid);
            self.services.insert(
                service.uuid,
                ServiceEntry {
                    descriptor: service.clone(),
                    characteristics: None,
                },
            );
        }
    }

    /// Replace cached characteristics of `service` for the discovered scope.
    pub(crate) fn replace_characteristics(
        &mut self,
        service: &Uuid,
        filter: Option<&[Uuid]>,
        discovered: &[CharacteristicDescriptor],
    ) -> Result<()> {
        let entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })?;

        let mut characteristics = match (filter, entry.characteristics.take()) {
            (Some(uuids), Some(mut existing)) => {
                existing.retain(|c| !uuids.contains(&c.uuid));
                existing
            }
            _ => Vec::new(),
        };

        for characteristic in discovered {
            if characteristic.service_uuid != *service {
                continue;
            }
            if let Some(uuids) = filter {
                if !uuids.contains(&characteristic.uuid) {
                    continue;
                }
            }
            if characteristics.iter().any(|c| c.uuid == characteristic.uuid) {
                continue;
            }
            characteristics.push(characteristic.clone());
        }

        entry.characteristics = Some(characteristics);
        Ok(())
    }

    pub(crate) fn has_service(&self, service: &Uuid) -> bool {
        self.services.contains_key(service)
    }

    pub(crate) fn services(&self) -> Vec<ServiceDescriptor> {
        self.order
            .iter()
            .filter_map(|uuid| self.services.get(uuid))
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Characteristics of a service, `None` if not yet discovered.
    pub(crate) fn characteristics(&self, service: &Uuid) -> Option<Vec<CharacteristicDescriptor>> {
        self.services
            .get(service)
            .and_then(|entry| entry.characteristics.clone())
    }

    /// Look up a characteristic.
    ///
    /// Returns [`Error::CharacteristicNotFound`] for anything not in the
    /// cache, including characteristics of undiscovered services.
    pub(crate) fn characteristic(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<CharacteristicDescriptor> {
        self.services
            .get(service)
            .and_then(|entry| entry.characteristics.as_ref())
            .and_then(|chars| chars.iter().find(|c| c.uuid == *characteristic))
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{uuid_from_u16, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
    use pretty_assertions::assert_eq;

    fn service(short: u16) -> ServiceDescriptor {
        ServiceDescriptor {
            uuid: uuid_from_u16(short),
            primary: true,
        }
    }

    fn characteristic(service: u16, short: u16, props: CharacteristicProperties) -> CharacteristicDescriptor {
        CharacteristicDescriptor {
            uuid: uuid_from_u16(short),
            service_uuid: uuid_from_u16(service),
            properties: props,
        }
    }

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.supports(GattOperation::Read));
        assert!(props.supports(GattOperation::Notify));
        assert!(!props.supports(GattOperation::Write));
        assert!(props.can_subscribe());
        assert!(!CharacteristicProperties::WRITE.can_subscribe());
        assert_eq!(props.bits(), 0x09);
    }

    #[test]
    fn test_require_operation() {
        let c = characteristic(0x180f, 0x2a19, CharacteristicProperties::READ);
        assert!(c.require(GattOperation::Read).is_ok());
        match c.require(GattOperation::Write) {
            Err(Error::UnsupportedOperation { operation, uuid }) => {
                assert_eq!(operation, "write");
                assert_eq!(uuid, BATTERY_LEVEL_UUID.to_string());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_characteristics_empty_until_discovered() {
        let mut cache = DescriptorCache::default();
        cache.replace_services(None, &[service(0x180f)]);

        assert!(cache.has_service(&BATTERY_SERVICE_UUID));
        assert_eq!(cache.characteristics(&BATTERY_SERVICE_UUID), None);
        assert!(matches!(
            cache.characteristic(&BATTERY_SERVICE_UUID, &BATTERY_LEVEL_UUID),
            Err(Error::CharacteristicNotFound { .. })
        ));

        cache
            .replace_characteristics(
                &BATTERY_SERVICE_UUID,
                None,
                &[characteristic(0x180f, 0x2a19, CharacteristicProperties::READ)],
            )
            .unwrap();
        assert!(cache
            .characteristic(&BATTERY_SERVICE_UUID, &BATTERY_LEVEL_UUID)
            .is_ok());
    }

    #[test]
    fn test_rediscovery_replaces_not_adds() {
        let mut cache = DescriptorCache::default();
        cache.replace_services(None, &[service(0x1800), service(0x180f)]);
        cache.replace_services(None, &[service(0x180f)]);
        assert_eq!(cache.services(), vec![service(0x180f)]);

        let svc = uuid_from_u16(0x180f);
        let read = CharacteristicProperties::READ;
        cache
            .replace_characteristics(
                &svc,
                None,
                &[characteristic(0x180f, 0x2a19, read), characteristic(0x180f, 0x2a1a, read)],
            )
            .unwrap();
        cache
            .replace_characteristics(&svc, None, &[characteristic(0x180f, 0x2a19, read)])
            .unwrap();
        assert_eq!(
            cache.characteristics(&svc).unwrap(),
            vec![characteristic(0x180f, 0x2a19, read)]
        );
    }

    #[test]
    fn test_filtered_rediscovery_only_touches_scope() {
        let mut cache = DescriptorCache::default();
        cache.replace_services(None, &[service(0x1800), service(0x180f)]);
        let svc = uuid_from_u16(0x180f);
        let read = CharacteristicProperties::READ;
        cache
            .replace_characteristics(
                &svc,
                None,
                &[characteristic(0x180f, 0x2a19, read), characteristic(0x180f, 0x2a1a, read)],
            )
            .unwrap();

        let filter = [uuid_from_u16(0x2a1a)];
        let notify = CharacteristicProperties::NOTIFY;
        cache
            .replace_characteristics(&svc, Some(&filter), &[characteristic(0x180f, 0x2a1a, notify)])
            .unwrap();
        let chars = cache.characteristics(&svc).unwrap();
        assert_eq!(chars.len(), 2);
        assert_eq!(
            cache
                .characteristic(&svc, &uuid_from_u16(0x2a1a))
                .unwrap()
                .properties,
            notify
        );

        // Filtered service rediscovery leaves the other service alone.
        cache.replace_services(Some(&[svc]), &[service(0x180f)]);
        assert_eq!(cache.services(), vec![service(0x1800), service(0x180f)]);
        assert_eq!(cache.characteristics(&svc), None);
    }

    #[test]
    fn test_characteristics_for_unknown_service() {
        let mut cache = DescriptorCache::default();
        let err = cache
            .replace_characteristics(&BATTERY_SERVICE_UUID, None, &[])
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
        cache.clear();
        assert!(cache.is_empty());
    }
}
