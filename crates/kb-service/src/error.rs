//! Error types for the service layer.

use kb_embeddings::EmbeddingError;
use kb_indexing::IndexingError;
use kb_scheduler::SchedulerError;
use kb_vector::VectorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ServiceError {
    fn from(e: config::ConfigError) -> Self {
        ServiceError::Config(e.to_string())
    }
}
