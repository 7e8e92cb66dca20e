//! # kb-service
//!
//! Wires the knowledge-base components into one application context.
//!
//! - [`Settings`]: layered configuration (defaults, file, `KB_*` env vars)
//! - [`AppContext`]: the index, embedder, checkpoint tracker, monitor and
//!   scheduler, built once and shared
//! - [`KnowledgeBase`]: search with hybrid re-ranking, chunk add and removal
//! - [`AdminService`]: operator commands returning [`AdminResponse`]

pub mod admin;
pub mod context;
pub mod embedder;
pub mod error;
pub mod knowledge_base;
pub mod settings;

pub use admin::{AdminResponse, AdminService};
pub use context::{AppContext, AppContextBuilder};
pub use embedder::ConfiguredEmbedder;
pub use error::ServiceError;
pub use knowledge_base::KnowledgeBase;
pub use settings::{EmbeddingProvider, EmbeddingSettings, Settings};
