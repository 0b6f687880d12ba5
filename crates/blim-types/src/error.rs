//! Error types for payload parsing in blim-types.

use thiserror::Error;

/// Errors that can occur when parsing GATT payloads.
///
/// This error type is platform-agnostic and does not include
/// radio errors (those belong in blim-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload length does not match what the format requires.
    #[error("invalid {kind} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Name of the payload being parsed.
        kind: &'static str,
        /// Required length description, e.g. `"2"` or `"at least 2"`.
        expected: String,
        /// Number of bytes received.
        actual: usize,
    },

    /// The payload has the right shape but inconsistent contents.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A text payload is not valid UTF-8.
    #[error("invalid UTF-8 in {kind}: {message}")]
    InvalidUtf8 {
        /// Name of the payload being parsed.
        kind: &'static str,
        /// Decoder message.
        message: String,
    },
}

impl ParseError {
    pub(crate) fn length(kind: &'static str, expected: impl Into<String>, actual: usize) -> Self {
        Self::InvalidLength {
            kind,
            expected: expected.into(),
            actual,
        }
    }
}

/// Result type alias using blim-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_length_display() {
        let err = ParseError::length("client configuration", "2", 3);
        assert_eq!(
            err.to_string(),
            "invalid client configuration length: expected 2 bytes, got 3"
        );
    }

    #[test]
    fn test_invalid_data_display() {
        let err = ParseError::InvalidData("duplicate handle 0x0010".into());
        assert_eq!(err.to_string(), "Invalid data: duplicate handle 0x0010");
    }
}
