//! # kb-types
//!
//! Shared domain types for the kb-retrieval knowledge base.
//!
//! This crate defines the data structures every other crate agrees on:
//! - Chunks: independently embedded units of text
//! - Chunk metadata: the typed fields the ranker and removal logic read
//! - Source types: where a chunk came from (pdf, website, other)
//!
//! ## Usage
//!
//! ```rust
//! use kb_types::{ChunkMetadata, SourceType};
//!
//! let meta = ChunkMetadata::new(SourceType::Website).with_url("https://example.org/topics/lupus");
//! assert_eq!(meta.source_type, SourceType::Website);
//! ```

pub mod chunk;
pub mod error;

pub use chunk::{Chunk, ChunkMetadata, Citation, SourceType};
pub use error::TypesError;
