//! Wire codec for the analyzer's command and notification characteristics.
//!
//! [`encode`] builds command payloads. [`decode`] turns one notification
//! buffer into a partial [`MeasurementReading`] plus the out-of-band
//! [`ProtocolEvent`]s it carried.
//!
//! Decoding is total: BLE delivery is best effort, and a corrupt or
//! truncated buffer must never abort a session that is otherwise
//! progressing. Anything that cannot be parsed becomes a [`DecodeWarning`]
//! and leaves the reading untouched.
//!
//! # Notification format
//!
//! A notification is a concatenation of records:
//!
//! | Tag | Payload | Meaning |
//! |-----|---------|---------|
//! | `0x01..=0x0E` | `f32` LE | [`MeasurementField`] value |
//! | `0xE1` | - | secondary (water activity) phase started |
//! | `0xE2` | - | secondary phase ended |
//! | `0xE3` | - | measurement complete |
//! | `0xE4` | `u8` code | device error |
//! | `0xE5` | - | command acknowledged |

use std::fmt;

use bytes::Buf;

use roastlink_types::{CoffeeType, MeasurementField, MeasurementReading};

use crate::commands::{
    CANCEL_MEASUREMENT, EVENT_ACK, EVENT_COMPLETE, EVENT_DEVICE_ERROR, EVENT_SECONDARY_ENDED,
    EVENT_SECONDARY_STARTED, FIELD_RECORD_LEN, REQUEST_STATUS, START_MEASUREMENT,
};

/// Commands understood by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a measurement for the given coffee type.
    StartMeasurement,
    /// Abort the running measurement.
    CancelMeasurement,
    /// Ask the analyzer to re-send its status.
    RequestStatus,
}

/// Encode a command for the command characteristic.
///
/// `coffee_type` is only carried by [`Command::StartMeasurement`].
///
/// ```
/// use roastlink_core::codec::{encode, Command};
/// use roastlink_types::CoffeeType;
///
/// assert_eq!(encode(Command::StartMeasurement, CoffeeType::Green), vec![0x10, 0x01]);
/// assert_eq!(encode(Command::CancelMeasurement, CoffeeType::Green), vec![0x11]);
/// ```
#[must_use]
pub fn encode(command: Command, coffee_type: CoffeeType) -> Vec<u8> {
    match command {
        Command::StartMeasurement => vec![START_MEASUREMENT, coffee_type.as_byte()],
        Command::CancelMeasurement => vec![CANCEL_MEASUREMENT],
        Command::RequestStatus => vec![REQUEST_STATUS],
    }
}

/// Out-of-band signals carried alongside measurement fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEvent {
    /// The water-activity sub-measurement has started.
    SecondaryPhaseStarted,
    /// The water-activity sub-measurement has ended.
    SecondaryPhaseEnded,
    /// The measurement is complete.
    MeasurementComplete,
    /// The analyzer reported an error.
    DeviceError(u8),
    /// The last command was acknowledged.
    Acknowledged,
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolEvent::SecondaryPhaseStarted => write!(f, "secondary-phase-started"),
            ProtocolEvent::SecondaryPhaseEnded => write!(f, "secondary-phase-ended"),
            ProtocolEvent::MeasurementComplete => write!(f, "complete"),
            ProtocolEvent::DeviceError(code) => write!(f, "device-error(0x{code:02X})"),
            ProtocolEvent::Acknowledged => write!(f, "ack"),
        }
    }
}

/// Something in a notification buffer that could not be decoded.
///
/// Warnings are observational only; they are logged and recorded but never
/// change a session's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeWarning {
    /// The buffer was empty.
    Empty,
    /// A tag byte that is neither a field nor an event. The rest of the
    /// buffer after it was skipped.
    UnknownTag {
        /// Byte offset of the tag.
        offset: usize,
        /// The tag value.
        tag: u8,
        /// Bytes skipped, including the tag.
        skipped: usize,
    },
    /// A record was cut short.
    Truncated {
        /// Byte offset of the record.
        offset: usize,
        /// The record's tag.
        tag: u8,
        /// Bytes the record needs.
        needed: usize,
        /// Bytes that were left.
        available: usize,
    },
    /// A field carried NaN or infinity.
    NonFinite {
        /// Byte offset of the record.
        offset: usize,
        /// The affected field.
        field: MeasurementField,
    },
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeWarning::Empty => write!(f, "empty notification"),
            DecodeWarning::UnknownTag {
                offset,
                tag,
                skipped,
            } => write!(
                f,
                "unknown tag 0x{tag:02X} at offset {offset}, skipped {skipped} byte(s)"
            ),
            DecodeWarning::Truncated {
                offset,
                tag,
                needed,
                available,
            } => write!(
                f,
                "truncated record 0x{tag:02X} at offset {offset}: needs {needed} byte(s), {available} left"
            ),
            DecodeWarning::NonFinite { offset, field } => {
                write!(f, "non-finite {field} value at offset {offset}")
            }
        }
    }
}

/// Result of decoding one notification buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    /// Fields found in the buffer.
    pub reading: MeasurementReading,
    /// Events in the order they appeared.
    pub events: Vec<ProtocolEvent>,
    /// Problems found while decoding.
    pub warnings: Vec<DecodeWarning>,
}

impl Decoded {
    /// Whether the buffer carried the given event.
    #[must_use]
    pub fn has_event(&self, event: ProtocolEvent) -> bool {
        self.events.contains(&event)
    }

    /// Whether nothing usable was decoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reading.is_empty() && self.events.is_empty()
    }
}

/// Decode one notification buffer. Never panics and never fails.
///
/// ```
/// use roastlink_core::codec::{decode, ProtocolEvent};
///
/// let mut buf = vec![0x01];
/// buf.extend_from_slice(&11.8f32.to_le_bytes());
/// buf.push(0xE3);
///
/// let decoded = decode(&buf);
/// assert_eq!(decoded.reading.moisture, Some(11.8));
/// assert!(decoded.has_event(ProtocolEvent::MeasurementComplete));
/// assert!(decoded.warnings.is_empty());
/// ```
#[must_use]
pub fn decode(data: &[u8]) -> Decoded {
    let mut out = Decoded::default();
    if data.is_empty() {
        out.warnings.push(DecodeWarning::Empty);
        return out;
    }

    let mut buf = data;
    while buf.has_remaining() {
        let offset = data.len() - buf.remaining();
        let tag = buf.get_u8();

        match tag {
            EVENT_SECONDARY_STARTED => out.events.push(ProtocolEvent::SecondaryPhaseStarted),
            EVENT_SECONDARY_ENDED => out.events.push(ProtocolEvent::SecondaryPhaseEnded),
            EVENT_COMPLETE => out.events.push(ProtocolEvent::MeasurementComplete),
            EVENT_ACK => out.events.push(ProtocolEvent::Acknowledged),
            EVENT_DEVICE_ERROR => {
                if !buf.has_remaining() {
                    out.warnings.push(DecodeWarning::Truncated {
                        offset,
                        tag,
                        needed: 2,
                        available: 1,
                    });
                    break;
                }
                out.events.push(ProtocolEvent::DeviceError(buf.get_u8()));
            }
            _ => match MeasurementField::try_from(tag) {
                Ok(field) => {
                    if buf.remaining() < FIELD_RECORD_LEN - 1 {
                        out.warnings.push(DecodeWarning::Truncated {
                            offset,
                            tag,
                            needed: FIELD_RECORD_LEN,
                            available: buf.remaining() + 1,
                        });
                        break;
                    }
                    let value = buf.get_f32_le();
                    if value.is_finite() {
                        out.reading.set(field, value);
                    } else {
                        out.warnings.push(DecodeWarning::NonFinite { offset, field });
                    }
                }
                Err(_) => {
                    // Record length is unknowable past an unknown tag.
                    out.warnings.push(DecodeWarning::UnknownTag {
                        offset,
                        tag,
                        skipped: buf.remaining() + 1,
                    });
                    break;
                }
            },
        }
    }

    out
}

/// Encode a single field record. Used by tests and the mock adapter.
#[must_use]
pub fn field_record(field: MeasurementField, value: f32) -> Vec<u8> {
    let mut record = Vec::with_capacity(FIELD_RECORD_LEN);
    record.push(field.id());
    record.extend_from_slice(&value.to_le_bytes());
    record
}

/// Encode a single event record. Used by tests and the mock adapter.
#[must_use]
pub fn event_record(event: ProtocolEvent) -> Vec<u8> {
    match event {
        ProtocolEvent::SecondaryPhaseStarted => vec![EVENT_SECONDARY_STARTED],
        ProtocolEvent::SecondaryPhaseEnded => vec![EVENT_SECONDARY_ENDED],
        ProtocolEvent::MeasurementComplete => vec![EVENT_COMPLETE],
        ProtocolEvent::DeviceError(code) => vec![EVENT_DEVICE_ERROR, code],
        ProtocolEvent::Acknowledged => vec![EVENT_ACK],
    }
}

/// Decode the standard battery level characteristic (one byte, percent).
///
/// Values above 100 are clamped. Returns `None` for an empty buffer.
#[must_use]
pub fn decode_battery(data: &[u8]) -> Option<u8> {
    data.first().map(|b| (*b).min(100))
}

/// Decode a Device Information string characteristic.
///
/// Invalid UTF-8 is replaced, trailing NULs and whitespace are trimmed.
/// Returns `None` when nothing is left.
#[must_use]
pub fn decode_string(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
