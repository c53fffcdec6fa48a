//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A single line exceeds the maximum allowed length.
    #[error("line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong {
        /// Actual line length.
        size: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A line was empty after trimming.
    #[error("empty line")]
    EmptyLine,

    /// A scheme name was not one of the known listener schemes.
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
}

/// Result type alias using ProtocolError.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            ProtocolError::Serialization(err.to_string())
        } else {
            ProtocolError::Deserialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_too_long_display() {
        let err = ProtocolError::LineTooLong { size: 70000, max: 65536 };
        assert_eq!(
            err.to_string(),
            "line too long: 70000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: ProtocolError = err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
