//! Error types for roastlink-core.
//!
//! This module defines the errors that can occur while scanning for,
//! connecting to and measuring with the coffee analyzer.
//!
//! # What the caller should do
//!
//! | Error Type | Strategy | Surfaced to user |
//! |------------|----------|------------------|
//! | [`Error::AdapterOff`] / [`Error::PermissionDenied`] | Show diagnostic text | Yes, as guidance |
//! | [`Error::ConnectionFailed`] | Offer retry or "go to devices" | Yes |
//! | [`Error::MeasurementTimeout`] | Offer retry | Yes |
//! | [`Error::SessionAborted`] | Reconnect, then retry | Yes |
//! | [`Error::InvalidState`] | Caller bug, the UI should have prevented it | No |
//! | [`Error::Timeout`] | Retry (2-3 times) | No |
//! | [`Error::Bluetooth`] | Retry, then reconnect | No |
//!
//! Malformed protocol data is never an `Error`: the codec absorbs it as a
//! [`DecodeWarning`](crate::codec::DecodeWarning). Save failures are never
//! surfaced either: the persistence gateway degrades them to
//! [`SaveOutcome::OfflineQueued`](crate::persistence::SaveOutcome::OfflineQueued).
//!
//! ## Retry classification
//!
//! [`Error::is_retryable`] is used by [`crate::with_retry`]:
//!
//! - retryable: `Timeout`, `Bluetooth`, `NotConnected`, `Io`, and
//!   `ConnectionFailed` with `Timeout`, `OutOfRange` or `BleError` reasons
//! - everything else is final

use std::time::Duration;

use thiserror::Error;

use roastlink_types::ConnectionState;

/// Errors that can occur when talking to the analyzer.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the platform stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The Bluetooth adapter is powered off.
    #[error("Bluetooth is off")]
    AdapterOff,

    /// The application is not allowed to use Bluetooth.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Device id not known to the adapter.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A required GATT characteristic is missing on the connected device.
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Connection attempt failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// A second connection was requested while one is live.
    #[error("Already connected or connecting (state: {0})")]
    AlreadyConnected(ConnectionState),

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device")]
    NotConnected,

    /// Operation not allowed in the current connection state.
    #[error("Operation '{operation}' requires {expected}, current state is {actual}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// Human readable description of the required state.
        expected: &'static str,
        /// The state at the time of the call.
        actual: ConnectionState,
    },

    /// A state transition outside the documented edges was requested.
    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ConnectionState,
        /// Requested state.
        to: ConnectionState,
    },

    /// The measurement did not finish within the session timeout.
    #[error("Measurement timed out after {elapsed:?}")]
    MeasurementTimeout {
        /// Time spent before giving up.
        elapsed: Duration,
    },

    /// The measurement ended because the link to the device was lost.
    #[error("Measurement aborted: {0}")]
    SessionAborted(String),

    /// The analyzer reported an error during measurement.
    #[error("Device reported error code 0x{code:02X}")]
    DeviceReported {
        /// Vendor error code.
        code: u8,
    },

    /// Save was attempted for a measurement that has not completed.
    #[error("Measurement is not complete")]
    NotComplete,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A characteristic returned data that could not be interpreted.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The measurement backend rejected a request or could not be reached.
    #[error(transparent)]
    Api(#[from] crate::persistence::ApiError),

    /// Offline queue storage failed.
    #[error("Offline queue error: {0}")]
    Queue(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Device is out of range.
    OutOfRange,
    /// Connection attempt timed out.
    Timeout,
    /// GATT layer reported a failure (service discovery, pairing).
    GattFailure(String),
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::GattFailure(msg) => write!(f, "GATT failure: {}", msg),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(
        operation: &'static str,
        expected: &'static str,
        actual: ConnectionState,
    ) -> Self {
        Self::InvalidState {
            operation,
            expected,
            actual,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Bluetooth(_) | Error::NotConnected | Error::Io(_) => {
                true
            }
            Error::ConnectionFailed { reason, .. } => matches!(
                reason,
                ConnectionFailureReason::Timeout
                    | ConnectionFailureReason::OutOfRange
                    | ConnectionFailureReason::BleError(_)
            ),
            _ => false,
        }
    }

    /// Whether this error must interrupt the user with a retry choice.
    pub fn needs_user_action(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::MeasurementTimeout { .. }
                | Error::SessionAborted(_)
                | Error::DeviceReported { .. }
        )
    }
}

/// Result type alias using roastlink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::AdapterOff;
        assert_eq!(err.to_string(), "Bluetooth is off");

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));

        let err = Error::DeviceReported { code: 0x1F };
        assert_eq!(err.to_string(), "Device reported error code 0x1F");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::invalid_state("measure", "connected", ConnectionState::Idle);
        let msg = err.to_string();
        assert!(msg.contains("measure"));
        assert!(msg.contains("connected"));
        assert!(msg.contains("idle"));
    }

    #[test]
    fn test_connection_failure_reasons() {
        let err = Error::connection_failed(
            Some("AA:BB".to_string()),
            ConnectionFailureReason::GattFailure("discovery".to_string()),
        );
        assert_eq!(err.to_string(), "Connection failed: GATT failure: discovery");
        assert!(err.needs_user_action());
        assert!(!err.is_retryable());

        let err = Error::connection_failed(None, ConnectionFailureReason::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::timeout("read", Duration::from_secs(1)).is_retryable());
        assert!(Error::NotConnected.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::AdapterOff.is_retryable());
        assert!(!Error::MeasurementTimeout {
            elapsed: Duration::from_secs(300)
        }
        .is_retryable());
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
