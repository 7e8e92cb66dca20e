//! # kb-vector
//!
//! Similarity index, chunk store and snapshot persistence.
//!
//! The index holds vectors in positional slots; the chunk store holds text
//! and metadata in the same slot order. [`ChunkIndex`] keeps the two aligned
//! through every add, removal, unload and reload, and persists both through
//! [`SnapshotStore`].
//!
//! ## Features
//! - Exact flat index (squared L2, ties broken by insertion order)
//! - usearch-powered HNSW index for large collections
//! - Removal by full rebuild; the live index is swapped only on success
//! - Atomic snapshot writes with `.bak` rotation
//! - Unload/reload to release memory on demand

pub mod chunk_index;
pub mod error;
pub mod flat;
pub mod hnsw;
pub mod index;
pub mod persistence;
pub mod store;

pub use chunk_index::{
    search_shared, with_read, with_write, ChunkIndex, ChunkIndexConfig, IndexStats, ScoredChunk,
    SharedIndex,
};
pub use error::VectorError;
pub use flat::FlatIndex;
pub use hnsw::{HnswConfig, HnswIndex};
pub use index::{build_index, IndexKind, Neighbor, VectorIndex};
pub use persistence::{FileSource, LoadedSnapshot, SaveReport, SnapshotStore, VectorBlock};
pub use store::ChunkStore;
