//! Error types for the shared domain types.

use thiserror::Error;

/// Errors raised while parsing domain types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Unknown source type string
    #[error("Unknown source type: {0}")]
    UnknownSourceType(String),
}
