//! The index + store pair.
//!
//! [`ChunkIndex`] owns a [`VectorIndex`] and a [`ChunkStore`] and keeps them
//! slot-aligned: after every mutating call, `index.len() == store.len()`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use kb_embeddings::Embedding;
use kb_types::{Chunk, ChunkMetadata, SourceType};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::error::VectorError;
use crate::hnsw::HnswConfig;
use crate::index::{build_index, check_dimension, IndexKind, VectorIndex};
use crate::persistence::{FileSource, SaveReport, SnapshotStore, VectorBlock};
use crate::store::ChunkStore;

/// Index shared between the ingestion loop (writer) and queries (readers).
pub type SharedIndex = Arc<RwLock<ChunkIndex>>;

/// Chunk index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkIndexConfig {
    /// Index backend
    #[serde(default)]
    pub kind: IndexKind,
    /// Embedding dimension
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Minimum trimmed text length accepted by `add`
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    /// Candidates fetched per requested result
    #[serde(default = "default_oversample")]
    pub oversample: usize,
    #[serde(default)]
    pub hnsw: HnswConfig,
    /// Snapshot directory; `None` keeps everything in memory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_dimension() -> usize {
    384
}

fn default_min_text_length() -> usize {
    20
}

fn default_oversample() -> usize {
    4
}

impl Default for ChunkIndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::default(),
            dimension: default_dimension(),
            min_text_length: default_min_text_length(),
            oversample: default_oversample(),
            hnsw: HnswConfig::default(),
            data_dir: None,
        }
    }
}

impl ChunkIndexConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: IndexKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_min_text_length(mut self, min: usize) -> Self {
        self.min_text_length = min;
        self
    }

    /// Oversampling below 4 starves the ranker and is raised to 4.
    pub fn with_oversample(mut self, oversample: usize) -> Self {
        self.oversample = oversample;
        self
    }

    fn effective_oversample(&self) -> usize {
        self.oversample.max(4)
    }
}

/// A raw nearest-neighbor candidate with its text and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Squared L2 distance, lower is better
    pub distance: f32,
    /// Rank in the raw neighbor list
    pub position: usize,
}

/// Index statistics; answerable while unloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total: usize,
    pub by_type: BTreeMap<SourceType, usize>,
    pub dimension: usize,
    pub kind: IndexKind,
    pub loaded: bool,
    /// Chunks kept in the store that still wait for a vector
    #[serde(default)]
    pub pending_reembed: usize,
}

/// Similarity index and chunk store kept in lockstep.
pub struct ChunkIndex {
    config: ChunkIndexConfig,
    /// `None` while unloaded
    index: Option<Box<dyn VectorIndex>>,
    store: ChunkStore,
    snapshots: Option<SnapshotStore>,
    /// Stats captured at unload time
    cached_stats: Option<IndexStats>,
    /// Upstream ids captured at unload time
    cached_upstream: Option<HashSet<String>>,
    /// Chunks whose vectors were lost and must be embedded again. They are
    /// persisted with the store and survive unload and restart.
    pending_reembed: Vec<Chunk>,
}

impl std::fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkIndex")
            .field("kind", &self.config.kind)
            .field("dimension", &self.config.dimension)
            .field("chunks", &self.store.len())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl ChunkIndex {
    /// Open an index, loading the snapshot from `data_dir` when configured.
    pub fn open(config: ChunkIndexConfig) -> Result<Self, VectorError> {
        let snapshots = config.data_dir.clone().map(SnapshotStore::new);
        let mut this = Self {
            index: Some(build_index(
                config.kind,
                config.dimension,
                &config.hnsw,
                std::iter::empty(),
            )?),
            config,
            store: ChunkStore::new(),
            snapshots,
            cached_stats: None,
            cached_upstream: None,
            pending_reembed: Vec::new(),
        };

        if this.snapshots.is_some() {
            this.load_snapshot()?;
        }

        info!(
            kind = this.config.kind.as_str(),
            dimension = this.config.dimension,
            chunks = this.store.len(),
            pending_reembed = this.pending_reembed.len(),
            "Opened chunk index"
        );
        Ok(this)
    }

    /// In-memory index with no snapshot directory.
    pub fn in_memory(dimension: usize) -> Result<Self, VectorError> {
        Self::open(ChunkIndexConfig::new(dimension))
    }

    /// Wrap into the shared handle used across tasks.
    pub fn into_shared(self) -> SharedIndex {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &ChunkIndexConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.index.is_some()
    }

    pub fn is_persistent(&self) -> bool {
        self.snapshots.is_some()
    }

    /// Chunk count; the cached count while unloaded.
    pub fn len(&self) -> usize {
        match (&self.index, &self.cached_stats) {
            (None, Some(stats)) => stats.total,
            _ => self.store.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.store.get(id)
    }

    /// Read the snapshot into memory, replacing the current contents.
    fn load_snapshot(&mut self) -> Result<usize, VectorError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(self.store.len());
        };
        let loaded = snapshots.load()?;
        let store = ChunkStore::from_chunks(loaded.chunks)?;

        let dimension = self.config.dimension;
        let fits = |block: &VectorBlock| block.dimension == dimension && block.count() == store.len();
        let usable = match loaded.vectors {
            Some(live) if fits(&live) => Some(live),
            live => {
                if let Some(live) = &live {
                    error!(
                        dimension = live.dimension,
                        vectors = live.count(),
                        expected_dimension = dimension,
                        chunks = store.len(),
                        "Snapshot index does not match the store"
                    );
                }
                match loaded.vector_backup {
                    Some(backup) if fits(&backup) => {
                        warn!(vectors = backup.count(), "Using backup vector index");
                        Some(backup)
                    }
                    _ => None,
                }
            }
        };

        let mut pending = loaded.pending;
        match usable {
            Some(block) => {
                let index = build_index(
                    self.config.kind,
                    dimension,
                    &self.config.hnsw,
                    block.data.chunks_exact(dimension.max(1)),
                )?;
                self.index = Some(index);
                self.store = store;
            }
            None => {
                if !store.is_empty() {
                    error!(
                        chunks = store.len(),
                        index_source = ?loaded.index_source,
                        "Vector index lost, chunks queued for re-embedding"
                    );
                } else if loaded.index_source == FileSource::Unreadable {
                    warn!("Vector index unreadable, store empty");
                }
                pending.extend(store.chunks().iter().cloned());
                self.index = Some(build_index(
                    self.config.kind,
                    dimension,
                    &self.config.hnsw,
                    std::iter::empty(),
                )?);
                self.store = ChunkStore::new();
            }
        }

        let mut seen = HashSet::new();
        pending.retain(|c| seen.insert(c.id.clone()));
        self.pending_reembed = pending;
        self.cached_stats = None;
        self.cached_upstream = None;
        Ok(self.store.len())
    }

    fn ensure_loaded(&mut self) -> Result<(), VectorError> {
        if !self.is_loaded() {
            self.reload()?;
        }
        Ok(())
    }

    fn live_index(&self) -> Result<&dyn VectorIndex, VectorError> {
        self.index
            .as_deref()
            .ok_or_else(|| VectorError::Index("index is unloaded".to_string()))
    }

    fn live_index_mut(&mut self) -> Result<&mut Box<dyn VectorIndex>, VectorError> {
        self.index
            .as_mut()
            .ok_or_else(|| VectorError::Index("index is unloaded".to_string()))
    }

    /// Add a chunk under a fresh ULID; returns the id.
    pub fn add(
        &mut self,
        text: &str,
        embedding: &Embedding,
        metadata: ChunkMetadata,
    ) -> Result<String, VectorError> {
        let len = text.trim().chars().count();
        if len < self.config.min_text_length {
            return Err(VectorError::TooShort {
                len,
                min: self.config.min_text_length,
            });
        }
        check_dimension(self.config.dimension, &embedding.values)?;

        let id = Ulid::new().to_string();
        self.insert(Chunk::new(id.clone(), text, metadata), &embedding.values)?;
        debug!(id = %id, "Added chunk");
        Ok(id)
    }

    /// Add a chunk keeping its existing id (re-embedding after recovery).
    /// The chunk leaves the pending re-embed list once it has a vector.
    pub fn add_existing(&mut self, chunk: Chunk, embedding: &Embedding) -> Result<(), VectorError> {
        check_dimension(self.config.dimension, &embedding.values)?;
        self.ensure_loaded()?;
        if self.store.get(&chunk.id).is_some() {
            return Err(VectorError::Index(format!(
                "chunk {} already indexed",
                chunk.id
            )));
        }
        let id = chunk.id.clone();
        self.insert(chunk, &embedding.values)?;
        self.pending_reembed.retain(|c| c.id != id);
        Ok(())
    }

    fn insert(&mut self, chunk: Chunk, values: &[f32]) -> Result<(), VectorError> {
        self.ensure_loaded()?;
        self.live_index_mut()?.add(values)?;
        self.store.push(chunk);
        Ok(())
    }

    /// Nearest candidates for the ranker: `k * oversample` hits, best first.
    ///
    /// Needs a loaded index; use [`search_shared`] for transparent reload.
    pub fn search(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>, VectorError> {
        let index = self.live_index()?;
        check_dimension(self.config.dimension, &query.values)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let fetch = k.saturating_mul(self.config.effective_oversample());
        let hits = index.search(&query.values, fetch)?;

        Ok(hits
            .into_iter()
            .enumerate()
            .filter_map(|(position, hit)| {
                self.store.get_slot(hit.slot).map(|chunk| ScoredChunk {
                    id: chunk.id.clone(),
                    text: chunk.text.clone(),
                    metadata: chunk.metadata.clone(),
                    distance: hit.distance,
                    position,
                })
            })
            .collect())
    }

    /// Remove every chunk matching `predicate` by rebuilding the index from
    /// the survivors. The live index is replaced only if the rebuild succeeds.
    pub fn remove_where<F>(&mut self, predicate: F) -> Result<usize, VectorError>
    where
        F: Fn(&Chunk) -> bool,
    {
        self.ensure_loaded()?;

        let pending_before = self.pending_reembed.len();
        self.pending_reembed.retain(|c| !predicate(c));
        let removed_pending = pending_before - self.pending_reembed.len();

        let keep: Vec<bool> = self.store.chunks().iter().map(|c| !predicate(c)).collect();
        let removed = keep.iter().filter(|k| !**k).count();
        if removed == 0 {
            return Ok(removed_pending);
        }

        let index = self.live_index()?;
        let survivors = keep
            .iter()
            .enumerate()
            .filter(|(_, k)| **k)
            .filter_map(|(slot, _)| index.vector(slot));
        let rebuilt = build_index(
            self.config.kind,
            self.config.dimension,
            &self.config.hnsw,
            survivors,
        )
        .map_err(|e| VectorError::IndexRebuildFailed(e.to_string()))?;

        self.index = Some(rebuilt);
        self.store.retain_slots(&keep);

        let remaining = self.live_index()?.len();
        if remaining != self.store.len() {
            return Err(VectorError::IndexRebuildFailed(format!(
                "rebuilt index has {} slots for {} chunks",
                remaining,
                self.store.len()
            )));
        }

        info!(
            removed = removed + removed_pending,
            remaining = remaining,
            "Rebuilt index after removal"
        );
        Ok(removed + removed_pending)
    }

    pub fn remove_by_document_id(&mut self, document_id: &str) -> Result<usize, VectorError> {
        self.remove_where(|c| c.metadata.document_id.as_deref() == Some(document_id))
    }

    /// Remove by local id or upstream `chunk_id`.
    pub fn remove_chunk(&mut self, chunk_id: &str) -> Result<usize, VectorError> {
        self.remove_where(|c| c.id == chunk_id || c.metadata.chunk_id.as_deref() == Some(chunk_id))
    }

    /// Case-insensitive substring match on `url`. An empty pattern matches nothing.
    pub fn remove_by_url_pattern(&mut self, pattern: &str) -> Result<usize, VectorError> {
        let Some(needle) = normalize_pattern(pattern) else {
            warn!("Ignoring empty URL pattern");
            return Ok(0);
        };
        self.remove_where(|c| contains_ci(c.metadata.url.as_deref(), &needle))
    }

    /// Case-insensitive substring match on `file_path`. An empty pattern matches nothing.
    pub fn remove_by_filename_pattern(&mut self, pattern: &str) -> Result<usize, VectorError> {
        let Some(needle) = normalize_pattern(pattern) else {
            warn!("Ignoring empty filename pattern");
            return Ok(0);
        };
        self.remove_where(|c| contains_ci(c.metadata.file_path.as_deref(), &needle))
    }

    /// Drop every chunk and vector; returns how many were removed.
    pub fn clear_all(&mut self) -> Result<usize, VectorError> {
        self.ensure_loaded()?;
        let count = self.store.len() + self.pending_reembed.len();
        self.live_index_mut()?.clear()?;
        self.store.clear();
        self.pending_reembed.clear();
        info!(removed = count, "Cleared index");
        Ok(count)
    }

    pub fn stats(&self) -> IndexStats {
        if let (None, Some(cached)) = (&self.index, &self.cached_stats) {
            return cached.clone();
        }
        IndexStats {
            total: self.store.len(),
            by_type: self.store.counts_by_type(),
            dimension: self.config.dimension,
            kind: self.config.kind,
            loaded: self.is_loaded(),
            pending_reembed: self.pending_reembed.len(),
        }
    }

    /// Persist index and store. Failures are logged and reported, never raised.
    pub fn save(&self) -> SaveReport {
        let Some(snapshots) = &self.snapshots else {
            debug!("No data directory, skipping save");
            return SaveReport::default();
        };
        let Some(index) = &self.index else {
            // Snapshot on disk is already current
            return SaveReport {
                index_saved: true,
                store_saved: true,
            };
        };
        snapshots.save_with_pending(
            self.config.dimension,
            index.raw(),
            &self.store,
            &self.pending_reembed,
        )
    }

    /// Persist, then drop vectors and text. Refuses if the persist failed.
    pub fn unload(&mut self) -> Result<usize, VectorError> {
        if !self.is_loaded() {
            return Ok(0);
        }
        let report = self.save();
        if !report.is_complete() {
            return Err(VectorError::PersistenceWriteFailed(format!(
                "refusing to unload: index_saved={}, store_saved={}",
                report.index_saved, report.store_saved
            )));
        }

        let mut stats = self.stats();
        stats.loaded = false;
        let count = stats.total;
        self.cached_stats = Some(stats);
        self.cached_upstream = Some(self.store.upstream_ids());
        self.index = None;
        self.store.clear();

        info!(chunks = count, "Unloaded index");
        Ok(count)
    }

    /// Restore from the snapshot. A loaded index is left as is.
    pub fn reload(&mut self) -> Result<usize, VectorError> {
        if self.is_loaded() {
            return Ok(self.store.len());
        }
        if self.snapshots.is_none() {
            return Err(VectorError::PersistenceCorrupt(
                "no data directory to reload from".to_string(),
            ));
        }
        let count = self.load_snapshot()?;
        info!(chunks = count, "Reloaded index");
        Ok(count)
    }

    /// Upstream `chunk_id` values present in the store, including chunks
    /// waiting for re-embedding. Answered without reloading an unloaded index.
    pub fn upstream_ids(&self) -> HashSet<String> {
        let mut ids = match (&self.index, &self.cached_upstream) {
            (None, Some(cached)) => cached.clone(),
            _ => self.store.upstream_ids(),
        };
        ids.extend(
            self.pending_reembed
                .iter()
                .filter_map(|c| c.metadata.chunk_id.clone()),
        );
        ids
    }

    pub fn contains_upstream(&self, chunk_id: &str) -> bool {
        let stored = match (&self.index, &self.cached_upstream) {
            (None, Some(cached)) => cached.contains(chunk_id),
            _ => self.store.contains_upstream(chunk_id),
        };
        stored
            || self
                .pending_reembed
                .iter()
                .any(|c| c.metadata.chunk_id.as_deref() == Some(chunk_id))
    }

    /// Chunks recovered from the store whose vectors were lost.
    pub fn pending_reembed(&self) -> &[Chunk] {
        &self.pending_reembed
    }
}

fn normalize_pattern(pattern: &str) -> Option<String> {
    let trimmed = pattern.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(needle))
        .unwrap_or(false)
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> VectorError {
    VectorError::Lock(format!("Index lock error: {}", e))
}

/// Search through the shared handle, reloading an unloaded index first.
///
/// A loaded index is searched under the read lock. An unloaded one is
/// reloaded and searched under a single write guard so nothing can unload
/// it in between.
pub fn search_shared(
    index: &SharedIndex,
    query: &Embedding,
    k: usize,
) -> Result<Vec<ScoredChunk>, VectorError> {
    {
        let guard = index.read().map_err(lock_err)?;
        if guard.is_loaded() {
            return guard.search(query, k);
        }
    }
    let mut guard = index.write().map_err(lock_err)?;
    guard.ensure_loaded()?;
    guard.search(query, k)
}

/// Run `f` under the write lock.
pub fn with_write<T>(
    index: &SharedIndex,
    f: impl FnOnce(&mut ChunkIndex) -> Result<T, VectorError>,
) -> Result<T, VectorError> {
    let mut guard = index.write().map_err(lock_err)?;
    f(&mut guard)
}

/// Run `f` under the read lock.
pub fn with_read<T>(index: &SharedIndex, f: impl FnOnce(&ChunkIndex) -> T) -> Result<T, VectorError> {
    let guard = index.read().map_err(lock_err)?;
    Ok(f(&guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_embeddings::HashingEmbedder;
    use tempfile::TempDir;

    const DIM: usize = 32;

    fn embed(text: &str) -> Embedding {
        HashingEmbedder::new(DIM).embed_sync(text)
    }

    fn pdf(doc: &str) -> ChunkMetadata {
        ChunkMetadata::new(SourceType::Pdf)
            .with_document_id(doc)
            .with_file_path(format!("/papers/{}.pdf", doc))
    }

    fn web(url: &str) -> ChunkMetadata {
        ChunkMetadata::new(SourceType::Website).with_url(url)
    }

    fn add(index: &mut ChunkIndex, text: &str, meta: ChunkMetadata) -> String {
        index.add(text, &embed(text), meta).unwrap()
    }

    fn persistent(temp: &TempDir) -> ChunkIndex {
        ChunkIndex::open(ChunkIndexConfig::new(DIM).with_data_dir(temp.path())).unwrap()
    }

    fn populate(index: &mut ChunkIndex) {
        add(index, "lupus nephritis treatment outcomes in adults", pdf("doc-a"));
        add(index, "renal biopsy findings in lupus patients", pdf("doc-a"));
        add(index, "cardiac involvement in systemic sclerosis", pdf("doc-b"));
        add(index, "patient guide to living with lupus", web("https://Example.org/Lupus/guide"));
        add(index, "clinic opening hours and contact details", web("https://example.org/contact"));
    }

    #[test]
    fn test_add_rejects_short_text() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        let result = index.add("too short", &embed("too short"), pdf("d"));
        assert!(matches!(result, Err(VectorError::TooShort { len: 9, min: 20 })));
        assert!(index.is_empty());
    }

    #[test]
    fn test_add_rejects_wrong_dimension() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        let wrong = HashingEmbedder::new(8).embed_sync("a reasonably long chunk of text");
        let result = index.add("a reasonably long chunk of text", &wrong, pdf("d"));
        assert!(matches!(result, Err(VectorError::DimensionMismatch { .. })));
        assert_eq!(index.stats().total, 0);
    }

    #[test]
    fn test_search_finds_exact_text_first() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        populate(&mut index);

        let hits = index
            .search(&embed("cardiac involvement in systemic sclerosis"), 2)
            .unwrap();
        assert_eq!(hits[0].text, "cardiac involvement in systemic sclerosis");
        assert!(hits[0].distance < 1e-5);
        // Oversampled: all 5 chunks come back for k = 2
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().enumerate().all(|(i, h)| h.position == i));
    }

    #[test]
    fn test_remove_by_document_id_keeps_alignment() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        populate(&mut index);

        let removed = index.remove_by_document_id("doc-a").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.len(), 3);
        assert_eq!(index.live_index().unwrap().len(), index.store.len());

        let hits = index.search(&embed("lupus nephritis"), 10).unwrap();
        assert!(hits
            .iter()
            .all(|h| h.metadata.document_id.as_deref() != Some("doc-a")));
        // Surviving vectors still belong to their own text
        let hits = index
            .search(&embed("clinic opening hours and contact details"), 1)
            .unwrap();
        assert_eq!(hits[0].text, "clinic opening hours and contact details");
    }

    #[test]
    fn test_remove_patterns_case_insensitive() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        populate(&mut index);

        assert_eq!(index.remove_by_url_pattern("example.org/lupus").unwrap(), 1);
        assert_eq!(index.remove_by_filename_pattern("DOC-B.PDF").unwrap(), 1);
        assert_eq!(index.remove_by_url_pattern("   ").unwrap(), 0);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_remove_chunk_by_local_or_upstream_id() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        let id = add(&mut index, "first chunk with enough text", pdf("d"));
        add(
            &mut index,
            "second chunk with enough text",
            pdf("d").with_chunk_id("up-2"),
        );

        assert_eq!(index.remove_chunk(&id).unwrap(), 1);
        assert_eq!(index.remove_chunk("up-2").unwrap(), 1);
        assert_eq!(index.remove_chunk("missing").unwrap(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_clear_all() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        populate(&mut index);
        assert_eq!(index.clear_all().unwrap(), 5);
        assert_eq!(index.stats().total, 0);
        assert!(index.search(&embed("lupus"), 3).unwrap().is_empty());
    }

    #[test]
    fn test_stats_counts_by_type() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        populate(&mut index);
        let stats = index.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_type[&SourceType::Pdf], 3);
        assert_eq!(stats.by_type[&SourceType::Website], 2);
        assert_eq!(stats.by_type[&SourceType::Other], 0);
        assert!(stats.loaded);
    }

    #[test]
    fn test_save_and_reopen_same_results() {
        let temp = TempDir::new().unwrap();
        let query = embed("lupus patients");
        let before: Vec<String> = {
            let mut index = persistent(&temp);
            populate(&mut index);
            assert!(index.save().is_complete());
            index.search(&query, 3).unwrap().into_iter().map(|h| h.id).collect()
        };

        let reopened = persistent(&temp);
        let after: Vec<String> = reopened
            .search(&query, 3)
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_unload_reload_preserves_stats() {
        let temp = TempDir::new().unwrap();
        let mut index = persistent(&temp);
        populate(&mut index);
        let before = index.stats();

        assert_eq!(index.unload().unwrap(), 5);
        assert!(!index.is_loaded());
        let while_unloaded = index.stats();
        assert_eq!(while_unloaded.total, before.total);
        assert_eq!(while_unloaded.by_type, before.by_type);
        assert!(!while_unloaded.loaded);

        assert_eq!(index.reload().unwrap(), 5);
        assert_eq!(index.stats(), before);
    }

    #[test]
    fn test_unload_refused_without_persistence() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        populate(&mut index);
        assert!(matches!(
            index.unload(),
            Err(VectorError::PersistenceWriteFailed(_))
        ));
        assert!(index.is_loaded());
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_add_after_unload_reloads() {
        let temp = TempDir::new().unwrap();
        let mut index = persistent(&temp);
        populate(&mut index);
        index.unload().unwrap();

        add(&mut index, "a brand new chunk after unloading", pdf("doc-c"));
        assert!(index.is_loaded());
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn test_search_shared_reloads() {
        let temp = TempDir::new().unwrap();
        let mut index = persistent(&temp);
        populate(&mut index);
        index.unload().unwrap();

        let shared = index.into_shared();
        let hits = search_shared(&shared, &embed("lupus"), 2).unwrap();
        assert!(!hits.is_empty());
        assert!(with_read(&shared, |i| i.is_loaded()).unwrap());
    }

    #[test]
    fn test_search_shared_races_with_unload() {
        let temp = TempDir::new().unwrap();
        let mut index = persistent(&temp);
        populate(&mut index);
        let shared = index.into_shared();
        let query = embed("lupus");

        std::thread::scope(|scope| {
            let unloader = shared.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    with_write(&unloader, |i| i.unload()).unwrap();
                }
            });
            for _ in 0..50 {
                let hits = search_shared(&shared, &query, 2).unwrap();
                assert_eq!(hits.len(), 5);
            }
        });
    }

    #[test]
    fn test_upstream_ids() {
        let mut index = ChunkIndex::in_memory(DIM).unwrap();
        add(&mut index, "chunk with upstream id attached", pdf("d").with_chunk_id("u1"));
        add(&mut index, "chunk without an upstream id here", pdf("d"));
        let ids = index.upstream_ids();
        assert_eq!(ids.len(), 1);
        assert!(index.contains_upstream("u1"));
    }

    #[test]
    fn test_upstream_ids_while_unloaded_do_not_reload() {
        let temp = TempDir::new().unwrap();
        let mut index = persistent(&temp);
        add(&mut index, "chunk with upstream id attached", pdf("d").with_chunk_id("u1"));
        index.unload().unwrap();

        assert!(index.upstream_ids().contains("u1"));
        assert!(index.contains_upstream("u1"));
        assert!(!index.contains_upstream("u2"));
        assert!(!index.is_loaded());
    }

    #[test]
    fn test_lost_index_queues_reembed() {
        let temp = TempDir::new().unwrap();
        {
            let mut index = persistent(&temp);
            populate(&mut index);
            index.save();
        }
        let snapshots = SnapshotStore::new(temp.path());
        std::fs::write(snapshots.index_path(), b"corrupt").unwrap();
        std::fs::remove_file(crate::persistence::backup_path(&snapshots.index_path())).ok();

        let mut index = persistent(&temp);
        assert!(index.is_empty());
        let pending = index.pending_reembed().to_vec();
        assert_eq!(pending.len(), 5);
        assert_eq!(index.stats().pending_reembed, 5);

        for chunk in pending {
            let e = embed(&chunk.text);
            index.add_existing(chunk, &e).unwrap();
        }
        assert_eq!(index.len(), 5);
        assert!(index.pending_reembed().is_empty());
    }

    #[test]
    fn test_pending_chunks_survive_save_and_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let mut index = persistent(&temp);
            populate(&mut index);
            index.save();
        }
        let snapshots = SnapshotStore::new(temp.path());
        std::fs::write(snapshots.index_path(), b"corrupt").unwrap();
        std::fs::remove_file(crate::persistence::backup_path(&snapshots.index_path())).ok();

        // Nothing re-embedded yet; saving twice must not lose the chunks
        {
            let index = persistent(&temp);
            assert_eq!(index.pending_reembed().len(), 5);
            assert!(index.save().is_complete());
            assert!(index.save().is_complete());
        }

        let mut index = persistent(&temp);
        assert_eq!(index.len(), 0);
        assert_eq!(index.pending_reembed().len(), 5);

        let first = index.pending_reembed()[0].clone();
        let e = embed(&first.text);
        index.add_existing(first, &e).unwrap();
        assert!(index.save().is_complete());

        let index = persistent(&temp);
        assert_eq!(index.len(), 1);
        assert_eq!(index.pending_reembed().len(), 4);
    }

    #[test]
    fn test_removal_and_upstream_ids_cover_pending() {
        let temp = TempDir::new().unwrap();
        {
            let mut index = persistent(&temp);
            add(&mut index, "lupus nephritis treatment outcomes", pdf("doc-a").with_chunk_id("u1"));
            add(&mut index, "cardiac involvement in sclerosis", pdf("doc-b").with_chunk_id("u2"));
            index.save();
        }
        let snapshots = SnapshotStore::new(temp.path());
        std::fs::remove_file(snapshots.index_path()).unwrap();
        std::fs::remove_file(crate::persistence::backup_path(&snapshots.index_path())).ok();

        let mut index = persistent(&temp);
        assert!(index.contains_upstream("u1"));
        assert_eq!(index.upstream_ids().len(), 2);

        assert_eq!(index.remove_by_document_id("doc-a").unwrap(), 1);
        assert!(!index.contains_upstream("u1"));
        assert_eq!(index.pending_reembed().len(), 1);
    }

    #[test]
    fn test_partial_save_recovers_from_backup_vectors() {
        let temp = TempDir::new().unwrap();
        let texts = [
            "lupus nephritis treatment outcomes in adults",
            "renal biopsy findings in lupus patients",
        ];
        {
            let mut index = persistent(&temp);
            for text in texts {
                add(&mut index, text, pdf("doc-a"));
            }
            assert!(index.save().is_complete());
        }

        // A later save wrote the index but not the store
        let snapshots = SnapshotStore::new(temp.path());
        let mut grown = vec![0.0f32; DIM * 3];
        for (slot, text) in texts.iter().enumerate() {
            grown[slot * DIM..(slot + 1) * DIM].copy_from_slice(&embed(text).values);
        }
        std::fs::write(
            crate::persistence::backup_path(&snapshots.index_path()),
            std::fs::read(snapshots.index_path()).unwrap(),
        )
        .unwrap();
        std::fs::write(
            snapshots.index_path(),
            crate::persistence::encode_vectors(DIM, &grown),
        )
        .unwrap();

        let index = persistent(&temp);
        assert_eq!(index.len(), 2);
        assert!(index.pending_reembed().is_empty());
        let hits = index.search(&embed(texts[1]), 1).unwrap();
        assert_eq!(hits[0].text, texts[1]);
    }

    #[test]
    fn test_count_mismatch_treated_as_corrupt() {
        let temp = TempDir::new().unwrap();
        let snapshots = SnapshotStore::new(temp.path());
        let mut store = ChunkStore::new();
        store.push(Chunk::new("a", "some chunk text here", pdf("d")));
        store.push(Chunk::new("b", "other chunk text here", pdf("d")));
        // One vector for two chunks
        snapshots.save(DIM, &vec![0.1; DIM], &store);

        let index = persistent(&temp);
        assert_eq!(index.len(), 0);
        assert_eq!(index.pending_reembed().len(), 2);
    }

    #[test]
    fn test_hnsw_backend_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = ChunkIndexConfig::new(DIM)
            .with_kind(IndexKind::Hnsw)
            .with_min_text_length(5)
            .with_oversample(2)
            .with_data_dir(temp.path());
        {
            let mut index = ChunkIndex::open(config.clone()).unwrap();
            populate(&mut index);
            add(&mut index, "short", pdf("doc-c"));
            assert_eq!(index.stats().kind, IndexKind::Hnsw);
            assert!(index.save().is_complete());
        }

        let index = ChunkIndex::open(config).unwrap();
        assert_eq!(index.len(), 6);
        let hits = index.search(&embed("renal biopsy findings in lupus patients"), 2).unwrap();
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].text, "renal biopsy findings in lupus patients");
    }
}
