//! Vector index error types.

use thiserror::Error;

/// Errors that can occur during index, store and snapshot operations.
#[derive(Debug, Error)]
pub enum VectorError {
    /// Chunk text below the configured minimum length
    #[error("Text too short: {len} chars, minimum {min}")]
    TooShort { len: usize, min: usize },

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// usearch index error
    #[error("Index error: {0}")]
    Index(String),

    /// Rebuild after removal failed; the previous index is still live
    #[error("Index rebuild failed: {0}")]
    IndexRebuildFailed(String),

    /// Snapshot could not be written
    #[error("Persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    /// Snapshot unreadable in both the live and the backup copy
    #[error("Persistence corrupt: {0}")]
    PersistenceCorrupt(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lock poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl From<serde_json::Error> for VectorError {
    fn from(err: serde_json::Error) -> Self {
        VectorError::Serialization(err.to_string())
    }
}
