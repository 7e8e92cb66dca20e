//! Error types for checkpointing.

use kb_vector::VectorError;
use thiserror::Error;

/// Errors that can occur while tracking ingestion progress
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Checkpoint load/save issues
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Vector index error
    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}
