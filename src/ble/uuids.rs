//! BLE UUID constants and parsing.
//!
//! GATT UUIDs are opaque to the core, but callers often hold them as
//! strings. Everything entering the crate as text goes through
//! [`parse_uuid`] so a malformed identifier becomes an error, never a panic.

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth Base UUID (`00000000-0000-1000-8000-00805F9B34FB`).
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

// Generic Access / Device Information (Standard BLE)
/// Generic Access Service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1800_0000_1000_8000_00805f9b34fb);
/// Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);
/// Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_00805f9b34fb);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a29_0000_1000_8000_00805f9b34fb);

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number into a full 128-bit UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit short form if the UUID lies on the Bluetooth base.
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask = (1u128 << 96) - 1;
    if value & base_mask != BLUETOOTH_BASE_UUID.as_u128() & base_mask {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Parse a UUID string.
///
/// Accepts the 128-bit hyphenated or simple forms as well as the 16-bit
/// and 32-bit short forms (`"180A"`, `"0000180a"`) used by platform APIs.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentifier`] if the input is not a UUID.
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    let trimmed = value.trim();
    let invalid = || Error::InvalidIdentifier {
        value: value.to_string(),
    };

    match trimmed.len() {
        4 => u16::from_str_radix(trimmed, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// Parse a list of UUID strings, failing on the first invalid entry.
pub fn parse_uuids<'a, I>(values: I) -> Result<Vec<Uuid>>
where
    I: IntoIterator<Item = &'a str>,
{
    values.into_iter().map(parse_uuid).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            DEVICE_INFO_SERVICE_UUID.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(uuid_from_u16(0x2a19), BATTERY_LEVEL_UUID);
    }

    #[test]
    fn test_parse_short_and_long_forms() {
        assert_eq!(parse_uuid("180F").unwrap(), BATTERY_SERVICE_UUID);
        assert_eq!(parse_uuid("0000180f").unwrap(), BATTERY_SERVICE_UUID);
        assert_eq!(
            parse_uuid("0000180F-0000-1000-8000-00805F9B34FB").unwrap(),
            BATTERY_SERVICE_UUID
        );
        assert_eq!(
            parse_uuid("00726f62-6f74-7061-6a61-6d61732e6361").unwrap(),
            Uuid::from_u128(0x00726f62_6f74_7061_6a61_6d61732e6361)
        );
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "xyz", "18G0", "not-a-uuid-at-all", "0000180f-0000"] {
            match parse_uuid(bad) {
                Err(Error::InvalidIdentifier { value }) => assert_eq!(value, bad),
                other => panic!("expected InvalidIdentifier for {bad:?}, got {other:?}"),
            }
        }
        assert!(parse_uuids(["180a", "oops"]).is_err());
    }

    #[test]
    fn test_short_form() {
        assert_eq!(short_form(&BATTERY_LEVEL_UUID), Some(0x2a19));
        assert_eq!(
            short_form(&Uuid::from_u128(0x00726f62_6f74_7061_6a61_6d61732e6361)),
            None
        );
    }
}
