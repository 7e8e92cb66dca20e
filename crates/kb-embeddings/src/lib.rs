//! # kb-embeddings
//!
//! Embedding providers for the kb-retrieval knowledge base.
//!
//! The core only talks to providers through the [`EmbeddingModel`] trait.
//!
//! ## Providers
//! - [`HttpEmbedder`]: OpenAI-compatible `/embeddings` endpoint with bounded retry
//! - [`HashingEmbedder`]: deterministic feature-hashing embedder (offline, tests)
//! - [`CachedEmbedder`]: LRU cache in front of any provider; clearable under
//!   memory pressure

pub mod cache;
pub mod error;
pub mod hashing;
pub mod http;
pub mod model;

pub use cache::CachedEmbedder;
pub use error::EmbeddingError;
pub use hashing::HashingEmbedder;
pub use http::{HttpEmbedder, HttpEmbedderConfig};
pub use model::{Embedding, EmbeddingModel, ModelInfo};
