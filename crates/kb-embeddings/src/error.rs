//! Embedding error types.

use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Provider unreachable or returned a server-side failure
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    /// Request exceeded the configured timeout
    #[error("Embedding request timed out after {0} ms")]
    Timeout(u64),

    /// Provider answered with something we could not use
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// Provider rejected the request (4xx other than 429)
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Client configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EmbeddingError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_) | EmbeddingError::Timeout(_))
    }
}
