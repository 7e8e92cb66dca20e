//! Error types for the scheduler crate.

use kb_embeddings::EmbeddingError;
use kb_indexing::IndexingError;
use kb_vector::VectorError;
use thiserror::Error;

/// Errors that can occur during scheduling and ingestion.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Work source unreachable; retried with backoff
    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    /// Work source returned data that could not be used
    #[error("Work source error: {0}")]
    Source(String),

    /// Embedding provider failure for one item
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Index or persistence failure
    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    /// Checkpoint failure
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Scheduler loop is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// A reclaimer failed to release memory
    #[error("Reclaim failed for {name}: {reason}")]
    Reclaim { name: String, reason: String },
}

impl SchedulerError {
    /// Worth another attempt after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::UpstreamConnection(_))
    }
}
