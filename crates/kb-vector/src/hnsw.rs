//! HNSW index implementation using usearch.
//!
//! Parameters tuned for quality over speed:
//! - M = 16 (connections per layer)
//! - ef_construction = 200 (build-time quality)
//! - ef_search = 100 (search-time quality)
//!
//! The graph is keyed by slot number. Raw vectors are kept alongside the
//! graph so snapshots and rebuilds never depend on the usearch file format.

use serde::{Deserialize, Serialize};
use tracing::debug;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::VectorError;
use crate::index::{check_dimension, sort_neighbors, IndexKind, Neighbor, VectorIndex};

/// HNSW index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Number of connections per layer (M parameter)
    #[serde(default = "default_connectivity")]
    pub connectivity: usize,
    /// Build-time search depth (ef_construction)
    #[serde(default = "default_expansion_add")]
    pub expansion_add: usize,
    /// Query-time search depth (ef_search)
    #[serde(default = "default_expansion_search")]
    pub expansion_search: usize,
    /// Initial reservation; grows by doubling
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_connectivity() -> usize {
    16
}

fn default_expansion_add() -> usize {
    200
}

fn default_expansion_search() -> usize {
    100
}

fn default_capacity() -> usize {
    1024
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            connectivity: default_connectivity(),
            expansion_add: default_expansion_add(),
            expansion_search: default_expansion_search(),
            capacity: default_capacity(),
        }
    }
}

impl HnswConfig {
    pub fn with_connectivity(mut self, m: usize) -> Self {
        self.connectivity = m;
        self
    }

    pub fn with_expansion(mut self, ef_add: usize, ef_search: usize) -> Self {
        self.expansion_add = ef_add;
        self.expansion_search = ef_search;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// HNSW index wrapper around usearch.
pub struct HnswIndex {
    graph: Index,
    data: Vec<f32>,
    dimension: usize,
    config: HnswConfig,
}

impl HnswIndex {
    pub fn new(dimension: usize, config: HnswConfig) -> Result<Self, VectorError> {
        let graph = new_graph(dimension, &config)?;
        Ok(Self {
            graph,
            data: Vec::new(),
            dimension,
            config,
        })
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    fn ensure_capacity(&self, needed: usize) -> Result<(), VectorError> {
        if needed > self.graph.capacity() {
            let target = needed.max(self.graph.capacity() * 2).max(64);
            self.graph
                .reserve(target)
                .map_err(|e| VectorError::Index(e.to_string()))?;
            debug!(capacity = target, "Grew HNSW capacity");
        }
        Ok(())
    }
}

fn new_graph(dimension: usize, config: &HnswConfig) -> Result<Index, VectorError> {
    let options = IndexOptions {
        dimensions: dimension,
        metric: MetricKind::L2sq,
        quantization: ScalarKind::F32,
        connectivity: config.connectivity,
        expansion_add: config.expansion_add,
        expansion_search: config.expansion_search,
        multi: false,
    };

    let graph = Index::new(&options).map_err(|e| VectorError::Index(e.to_string()))?;
    graph
        .reserve(config.capacity.max(1))
        .map_err(|e| VectorError::Index(e.to_string()))?;
    Ok(graph)
}

impl VectorIndex for HnswIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.graph.size()
    }

    fn add(&mut self, values: &[f32]) -> Result<usize, VectorError> {
        check_dimension(self.dimension, values)?;
        let slot = self.len();
        self.ensure_capacity(slot + 1)?;
        self.graph
            .add(slot as u64, values)
            .map_err(|e| VectorError::Index(e.to_string()))?;
        self.data.extend_from_slice(values);
        Ok(slot)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorError> {
        check_dimension(self.dimension, query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let matches = self
            .graph
            .search(query, k)
            .map_err(|e| VectorError::Index(e.to_string()))?;

        let mut hits: Vec<Neighbor> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&key, &dist)| Neighbor::new(key as usize, dist))
            .collect();
        sort_neighbors(&mut hits);

        debug!(k = k, found = hits.len(), "HNSW search complete");
        Ok(hits)
    }

    fn vector(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    fn raw(&self) -> &[f32] {
        &self.data
    }

    fn clear(&mut self) -> Result<(), VectorError> {
        self.graph = new_graph(self.dimension, &self.config)?;
        self.data = Vec::new();
        Ok(())
    }
}
