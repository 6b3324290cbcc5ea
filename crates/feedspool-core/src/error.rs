//! Error types shared by the feedspool crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or interpreting events.
#[derive(Error, Debug)]
pub enum Error {
    /// A spool frame ended before its declared length.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame {
        /// Length announced by the frame header.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// A frame exceeded the maximum accepted size.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Unknown serialization type name.
    #[error("unknown serialization type '{0}'")]
    UnknownSerialization(String),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_frame_display() {
        let err = Error::TruncatedFrame {
            expected: 120,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("truncated frame"));
        assert!(msg.contains("120"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_unknown_serialization_display() {
        let err = Error::UnknownSerialization("smile".to_string());
        assert!(err.to_string().contains("'smile'"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
