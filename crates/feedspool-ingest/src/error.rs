//! Error types for the ingestion pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during spooling, routing and persistence.
#[derive(Error, Debug)]
pub enum Error {
    /// Codec or event model error.
    #[error(transparent)]
    Core(#[from] feedspool_core::Error),

    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A spool directory name does not follow the per-event layout.
    #[error("invalid local spool directory: {}", .0.display())]
    InvalidLocalDirectory(PathBuf),

    /// Spool writer error.
    #[error("Spool error: {0}")]
    Spool(String),

    /// A spool processor failed to process a file.
    #[error("Processor '{processor}' failed: {reason}")]
    Processor {
        processor: &'static str,
        reason: String,
    },

    /// The insertion buffer no longer accepts events.
    #[error("Insertion buffer is closed")]
    BufferClosed,

    /// Feed event or subscription store error.
    #[error("Store error: {0}")]
    Store(String),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_directory_display() {
        let err = Error::InvalidLocalDirectory(PathBuf::from("/spool/garbage"));
        assert!(err.to_string().contains("/spool/garbage"));
    }

    #[test]
    fn test_processor_display() {
        let err = Error::Processor {
            processor: "archive",
            reason: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("archive"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_from_core_error_is_transparent() {
        let core = feedspool_core::Error::UnknownSerialization("smile".to_string());
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
        assert_eq!(err.to_string(), "unknown serialization type 'smile'");
    }
}
