//! Bluetooth UUIDs for the coffee analyzer.
//!
//! This module contains the UUIDs needed to talk to the analyzer over
//! Bluetooth Low Energy: the vendor measurement service and the standard
//! Device Information / Battery characteristics read after connecting.

use uuid::{Uuid, uuid};

// --- Vendor Service UUIDs ---

/// Vendor measurement service advertised by the analyzer.
pub const ANALYZER_SERVICE: Uuid = uuid!("5a1e0001-c0ff-4e3a-9b2d-7e11a0b1c2d3");

/// Manufacturer ID carried in the analyzer's advertisement payload.
pub const MANUFACTURER_ID: u16 = 0x0C0F;

/// Advertised name prefix used as a fallback when the service UUID is not
/// part of the advertisement.
pub const NAME_PREFIX: &str = "coffeelab";

// --- Vendor Characteristic UUIDs ---

/// Command characteristic (write). Receives encoded commands.
pub const COMMAND: Uuid = uuid!("5a1e0002-c0ff-4e3a-9b2d-7e11a0b1c2d3");

/// Measurement data characteristic (notify). Streams field and event records.
pub const MEASUREMENT_DATA: Uuid = uuid!("5a1e0003-c0ff-4e3a-9b2d-7e11a0b1c2d3");

// --- Standard BLE Service UUIDs ---

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Device Information Characteristic UUIDs ---

/// Model number string characteristic.
pub const MODEL_NUMBER: Uuid = uuid!("00002a24-0000-1000-8000-00805f9b34fb");

/// Serial number string characteristic.
pub const SERIAL_NUMBER: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");

// --- Battery Characteristic UUIDs ---

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_uuids_share_base() {
        // All vendor UUIDs differ only in the first group
        let base = |u: Uuid| u.to_string()[8..].to_string();
        assert_eq!(base(ANALYZER_SERVICE), base(COMMAND));
        assert_eq!(base(ANALYZER_SERVICE), base(MEASUREMENT_DATA));
        assert_ne!(COMMAND, MEASUREMENT_DATA);
    }

    #[test]
    fn test_standard_characteristics() {
        assert_eq!(
            SERIAL_NUMBER.to_string(),
            "00002a25-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FIRMWARE_REVISION.to_string(),
            "00002a26-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_LEVEL.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }
}
