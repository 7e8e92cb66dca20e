//! Chunk store: the source of truth for text and metadata.
//!
//! Chunks are kept in slot order so that `chunks[i]` is the chunk whose
//! vector sits in index slot `i`.

use std::collections::{BTreeMap, HashMap, HashSet};

use kb_types::{Chunk, SourceType};
use serde::{Deserialize, Serialize};

use crate::error::VectorError;

/// Slot-ordered chunk storage with an id lookup table.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    positions: HashMap<String, usize>,
}

/// Serialized form of the store: the chunks plus counts by source type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub counts: BTreeMap<SourceType, usize>,
    /// Chunks kept without a vector until they can be embedded again
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from slot-ordered chunks. Duplicate ids are rejected.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Result<Self, VectorError> {
        let mut positions = HashMap::with_capacity(chunks.len());
        for (slot, chunk) in chunks.iter().enumerate() {
            if positions.insert(chunk.id.clone(), slot).is_some() {
                return Err(VectorError::Serialization(format!(
                    "duplicate chunk id {}",
                    chunk.id
                )));
            }
        }
        Ok(Self { chunks, positions })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Append a chunk; returns its slot.
    pub fn push(&mut self, chunk: Chunk) -> usize {
        let slot = self.chunks.len();
        self.positions.insert(chunk.id.clone(), slot);
        self.chunks.push(chunk);
        slot
    }

    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.positions.get(id).and_then(|&slot| self.chunks.get(slot))
    }

    pub fn get_slot(&self, slot: usize) -> Option<&Chunk> {
        self.chunks.get(slot)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Keep only the slots flagged `true`, preserving order.
    pub fn retain_slots(&mut self, keep: &[bool]) {
        let mut slot = 0;
        self.chunks.retain(|_| {
            let kept = keep.get(slot).copied().unwrap_or(true);
            slot += 1;
            kept
        });
        self.reindex_positions();
    }

    fn reindex_positions(&mut self) {
        self.positions = self
            .chunks
            .iter()
            .enumerate()
            .map(|(slot, c)| (c.id.clone(), slot))
            .collect();
    }

    /// Chunk counts per source type; every known type is present.
    pub fn counts_by_type(&self) -> BTreeMap<SourceType, usize> {
        let mut counts: BTreeMap<SourceType, usize> =
            SourceType::all().into_iter().map(|t| (t, 0)).collect();
        for chunk in &self.chunks {
            *counts.entry(chunk.source_type()).or_insert(0) += 1;
        }
        counts
    }

    /// Upstream `chunk_id` values recorded in metadata.
    pub fn upstream_ids(&self) -> HashSet<String> {
        self.chunks
            .iter()
            .filter_map(|c| c.metadata.chunk_id.clone())
            .collect()
    }

    pub fn contains_upstream(&self, chunk_id: &str) -> bool {
        self.chunks
            .iter()
            .any(|c| c.metadata.chunk_id.as_deref() == Some(chunk_id))
    }

    /// Drop everything and release capacity.
    pub fn clear(&mut self) {
        self.chunks = Vec::new();
        self.positions = HashMap::new();
    }

    pub fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            chunks: self.chunks.clone(),
            counts: self.counts_by_type(),
            pending: Vec::new(),
        }
    }
}
