//! Error types for the Aurum backup engine.

use thiserror::Error;

/// Main error type for backup and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("{0}")]
    Encryption(String),

    #[error("checksum error: {0}")]
    Checksum(String),

    #[error("pg_dump failed: {0}")]
    Dump(String),

    #[error("pg_restore failed: {0}")]
    Restore(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("integrity verification failed: {0}")]
    Integrity(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0} is not implemented")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Fixed message for AEAD authentication failures; operators and tests
    /// match on this text.
    pub(crate) fn invalid_key() -> Self {
        BackupError::Encryption("Invalid encryption key or corrupted file".to_string())
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
