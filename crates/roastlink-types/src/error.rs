//! Error types for data parsing in roastlink-types.

use thiserror::Error;

/// Errors that can occur when parsing analyzer values from text or bytes.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in roastlink-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Not enough bytes to decode a value.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown coffee type name or byte.
    #[error("Unknown coffee type: {0}")]
    UnknownCoffeeType(String),

    /// Unknown measurement field id.
    #[error("Unknown measurement field: 0x{0:02X}")]
    UnknownField(u8),

    /// Unknown link target kind.
    #[error("Unknown link kind: {0}")]
    UnknownLinkKind(String),

    /// Value was present but not valid.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using roastlink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::InsufficientBytes {
            expected: 5,
            actual: 2,
        };
        assert_eq!(err.to_string(), "Insufficient bytes: expected 5, got 2");

        let err = ParseError::UnknownField(0x7F);
        assert_eq!(err.to_string(), "Unknown measurement field: 0x7F");

        let err = ParseError::UnknownCoffeeType("decaf".to_string());
        assert!(err.to_string().contains("decaf"));
    }
}
