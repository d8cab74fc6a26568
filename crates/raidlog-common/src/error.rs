//! Error types for raidlog
//!
//! This module defines the common error type used by the journal engine.
//! Running out of log space or I/O unit slots is not an error: those
//! conditions park the stripe and are reported as an outcome instead.

use thiserror::Error;

/// Common result type for raidlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for raidlog
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("journal device is faulty")]
    JournalFaulty,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("journal is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors that indicate a caller bug rather than a runtime condition
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_) | Self::InvalidArgument(_) | Self::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
