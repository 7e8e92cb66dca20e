//! Vector index trait and types.
//!
//! An index stores vectors in positional slots `0..len`. Slot `i` always
//! corresponds to the i-th chunk of the chunk store; the index knows nothing
//! else about chunks. Neither backend supports deleting a slot in place, so
//! removals go through [`build_index`] with the surviving vectors.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::VectorError;
use crate::flat::FlatIndex;
use crate::hnsw::{HnswConfig, HnswIndex};

/// Which index backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact brute-force search
    #[default]
    Flat,
    /// Approximate HNSW search via usearch
    Hnsw,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Flat => "flat",
            IndexKind::Hnsw => "hnsw",
        }
    }
}

/// One search hit: a slot and its squared L2 distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub slot: usize,
    pub distance: f32,
}

impl Neighbor {
    pub fn new(slot: usize, distance: f32) -> Self {
        Self { slot, distance }
    }
}

/// Order hits by distance ascending, then by slot (insertion order).
pub fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(compare_neighbors);
}

pub(crate) fn compare_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.slot.cmp(&b.slot))
}

/// Trait for vector indexes.
///
/// Implementations must be thread-safe for concurrent read access.
pub trait VectorIndex: Send + Sync {
    fn kind(&self) -> IndexKind;

    fn dimension(&self) -> usize;

    /// Number of occupied slots.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector; returns its slot.
    fn add(&mut self, values: &[f32]) -> Result<usize, VectorError>;

    /// k nearest neighbors, best first, ties by slot.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorError>;

    /// Raw vector stored at a slot.
    fn vector(&self, slot: usize) -> Option<&[f32]>;

    /// All vectors, slot-major, `len * dimension` floats.
    fn raw(&self) -> &[f32];

    /// Drop every vector and release the backing memory.
    fn clear(&mut self) -> Result<(), VectorError>;
}

pub(crate) fn check_dimension(expected: usize, values: &[f32]) -> Result<(), VectorError> {
    if values.len() != expected {
        return Err(VectorError::DimensionMismatch {
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

/// Build a fresh index of the given kind from a slot-ordered vector list.
///
/// Used for loading snapshots and for rebuilding after removals. The caller
/// keeps its current index until this returns `Ok`.
pub fn build_index<'a>(
    kind: IndexKind,
    dimension: usize,
    hnsw: &HnswConfig,
    vectors: impl IntoIterator<Item = &'a [f32]>,
) -> Result<Box<dyn VectorIndex>, VectorError> {
    let mut index: Box<dyn VectorIndex> = match kind {
        IndexKind::Flat => Box::new(FlatIndex::new(dimension)),
        IndexKind::Hnsw => Box::new(HnswIndex::new(dimension, hnsw.clone())?),
    };
    for values in vectors {
        index.add(values)?;
    }
    Ok(index)
}
