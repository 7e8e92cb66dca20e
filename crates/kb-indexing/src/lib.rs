//! Checkpointing for incremental ingestion.
//!
//! ## Key Components
//!
//! - [`CheckpointTracker`]: TTL-cached set of upstream chunk ids already in
//!   the index, so each scheduler cycle can skip processed work cheaply
//! - [`IngestProgress`]: persisted counters that survive restarts and drive
//!   target-completion checks
//! - [`IndexingError`]: Error types for checkpoint operations
//!
//! The processed set is derived from the chunk store itself (each chunk
//! records its upstream `chunk_id`), so a crash between embedding and
//! persisting never marks an item processed that is not in the snapshot.

pub mod checkpoint;
pub mod error;
pub mod progress;

pub use checkpoint::{CheckpointConfig, CheckpointTracker};
pub use error::IndexingError;
pub use progress::{IngestProgress, PROGRESS_FILE};
