//! BLE protocol constants for the coffee analyzer.
//!
//! Opcodes written to the command characteristic and record tags found in
//! notifications on the measurement data characteristic.

/// Start a measurement.
/// Format: `[START_MEASUREMENT, coffee_type]`
/// coffee_type: 0x00 = auto, 0x01 = green, 0x02 = roasted
pub const START_MEASUREMENT: u8 = 0x10;

/// Abort the running measurement.
/// Format: `[CANCEL_MEASUREMENT]`
pub const CANCEL_MEASUREMENT: u8 = 0x11;

/// Ask the analyzer to re-send its status.
/// Format: `[REQUEST_STATUS]`
pub const REQUEST_STATUS: u8 = 0x12;

/// Size of a field record: tag byte plus `f32` little-endian value.
pub const FIELD_RECORD_LEN: usize = 5;

/// Water-activity secondary phase has started.
pub const EVENT_SECONDARY_STARTED: u8 = 0xE1;

/// Water-activity secondary phase has ended.
pub const EVENT_SECONDARY_ENDED: u8 = 0xE2;

/// Measurement is complete; no further fields follow.
pub const EVENT_COMPLETE: u8 = 0xE3;

/// Device error. Format: `[EVENT_DEVICE_ERROR, code]`
pub const EVENT_DEVICE_ERROR: u8 = 0xE4;

/// Command acknowledged.
pub const EVENT_ACK: u8 = 0xE5;
