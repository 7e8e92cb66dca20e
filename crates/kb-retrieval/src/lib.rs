//! # kb-retrieval
//!
//! Post-retrieval re-ranking for the knowledge base.
//!
//! Raw nearest-neighbor candidates from [`kb_vector::ChunkIndex::search`] are
//! re-scored by combining their vector distance with:
//!
//! - **Keyword overlap** between the query and the chunk text
//! - **Source-type boosts** for website chunks (structural markers, topic
//!   URLs, later crawl pages, injected domain terms)
//! - **Diversity** so the top results are not all from one source type when
//!   another type is in the candidate pool
//!
//! Every signal is a fractional reduction of the distance, capped below 1,
//! so a re-ranked score never becomes negative and similarity still matters.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kb_retrieval::{HybridRanker, RankerConfig};
//!
//! let ranker = HybridRanker::new(RankerConfig::default());
//! let candidates = index.search(&query_embedding, 5)?;
//! let results = ranker.rank("lupus nephritis", candidates, 5);
//! ```

pub mod config;
pub mod ranker;
pub mod tokenize;

pub use config::RankerConfig;
pub use ranker::{HybridRanker, RankedChunk};
pub use tokenize::{term_set, tokenize};
