//! Query and mutation facade over the shared index.
//!
//! Every mutation that removes chunks persists the snapshot and invalidates
//! the checkpoint cache so removed upstream ids become eligible again.

use std::sync::Arc;

use kb_embeddings::EmbeddingModel;
use kb_indexing::CheckpointTracker;
use kb_retrieval::{HybridRanker, RankedChunk};
use kb_types::ChunkMetadata;
use kb_vector::{
    search_shared, with_read, with_write, ChunkIndex, IndexStats, SaveReport, SharedIndex,
    VectorError,
};
use tracing::{debug, info, warn};

use crate::error::ServiceError;

pub struct KnowledgeBase {
    index: SharedIndex,
    embedder: Arc<dyn EmbeddingModel>,
    ranker: HybridRanker,
    checkpoint: Arc<CheckpointTracker>,
}

impl KnowledgeBase {
    pub fn new(
        index: SharedIndex,
        embedder: Arc<dyn EmbeddingModel>,
        ranker: HybridRanker,
        checkpoint: Arc<CheckpointTracker>,
    ) -> Self {
        Self {
            index,
            embedder,
            ranker,
            checkpoint,
        }
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn ranker(&self) -> &HybridRanker {
        &self.ranker
    }

    /// Embed the query, fetch oversampled candidates and re-rank them.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RankedChunk>, ServiceError> {
        if query.trim().is_empty() {
            return Err(ServiceError::InvalidInput("query is empty".to_string()));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;
        let candidates = search_shared(&self.index, &embedding, top_k)?;
        let candidate_count = candidates.len();
        let results = self.ranker.rank(query, candidates, top_k);
        debug!(
            top_k,
            candidates = candidate_count,
            returned = results.len(),
            "Search complete"
        );
        Ok(results)
    }

    /// Embed and index one chunk.
    ///
    /// If `metadata.chunk_id` is already indexed nothing is added and `None`
    /// is returned, so re-adding the same upstream chunk is a no-op.
    pub async fn add_chunk(
        &self,
        text: &str,
        metadata: ChunkMetadata,
    ) -> Result<Option<String>, ServiceError> {
        if let Some(upstream) = metadata.chunk_id.as_deref() {
            if with_read(&self.index, |index| index.contains_upstream(upstream))? {
                debug!(chunk_id = upstream, "Chunk already indexed");
                return Ok(None);
            }
        }

        let embedding = self.embedder.embed(text).await?;
        let upstream = metadata.chunk_id.clone();
        let id = with_write(&self.index, |index| {
            // The embed call ran without the lock; check again
            if let Some(upstream) = upstream.as_deref() {
                if index.contains_upstream(upstream) {
                    return Ok(None);
                }
            }
            index.add(text, &embedding, metadata).map(Some)
        })?;

        if let (Some(_), Some(upstream)) = (&id, upstream.as_deref()) {
            self.checkpoint.mark_processed(upstream);
        }
        Ok(id)
    }

    fn mutate<F>(&self, op: &str, f: F) -> Result<usize, ServiceError>
    where
        F: FnOnce(&mut ChunkIndex) -> Result<usize, VectorError>,
    {
        let removed = with_write(&self.index, |index| {
            let removed = f(index)?;
            if removed > 0 {
                let report = index.save();
                if index.is_persistent() && !report.is_complete() {
                    warn!(
                        op,
                        index_saved = report.index_saved,
                        store_saved = report.store_saved,
                        "Snapshot incomplete after removal"
                    );
                }
            }
            Ok(removed)
        })?;

        if removed > 0 {
            self.checkpoint.invalidate();
        }
        info!(op, removed, "Index mutation");
        Ok(removed)
    }

    pub fn remove_by_document_id(&self, document_id: &str) -> Result<usize, ServiceError> {
        self.mutate("remove_by_document_id", |index| {
            index.remove_by_document_id(document_id)
        })
    }

    /// Remove by local id or upstream chunk id.
    pub fn remove_chunk(&self, chunk_id: &str) -> Result<usize, ServiceError> {
        self.mutate("remove_chunk", |index| index.remove_chunk(chunk_id))
    }

    pub fn remove_by_url_pattern(&self, pattern: &str) -> Result<usize, ServiceError> {
        self.mutate("remove_by_url_pattern", |index| {
            index.remove_by_url_pattern(pattern)
        })
    }

    pub fn remove_by_filename_pattern(&self, pattern: &str) -> Result<usize, ServiceError> {
        self.mutate("remove_by_filename_pattern", |index| {
            index.remove_by_filename_pattern(pattern)
        })
    }

    pub fn clear_all(&self) -> Result<usize, ServiceError> {
        self.mutate("clear_all", |index| index.clear_all())
    }

    pub fn stats(&self) -> Result<IndexStats, ServiceError> {
        Ok(with_read(&self.index, |index| index.stats())?)
    }

    pub fn save(&self) -> Result<SaveReport, ServiceError> {
        Ok(with_read(&self.index, |index| index.save())?)
    }

    pub fn unload(&self) -> Result<usize, ServiceError> {
        Ok(with_write(&self.index, |index| index.unload())?)
    }

    pub fn reload(&self) -> Result<usize, ServiceError> {
        Ok(with_write(&self.index, |index| index.reload())?)
    }

    /// Re-embed chunks whose vectors were lost when the snapshot was loaded.
    ///
    /// Chunks that fail to embed stay pending: they are saved with the store,
    /// keep their upstream ids in the checkpoint set and are tried again on
    /// the next recovery. Returns the number recovered.
    pub async fn recover_index(&self) -> Result<usize, ServiceError> {
        let pending = with_read(&self.index, |index| index.pending_reembed().to_vec())?;
        if pending.is_empty() {
            return Ok(0);
        }
        warn!(chunks = pending.len(), "Re-embedding chunks after index loss");

        let total = pending.len();
        let mut recovered = 0;
        for chunk in pending {
            let embedding = match self.embedder.embed(&chunk.text).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(
                        id = %chunk.id,
                        chunk_id = ?chunk.metadata.chunk_id,
                        error = %e,
                        "Cannot re-embed chunk, keeping it pending"
                    );
                    continue;
                }
            };
            let id = chunk.id.clone();
            match with_write(&self.index, |index| index.add_existing(chunk, &embedding)) {
                Ok(()) => recovered += 1,
                Err(e) => warn!(id = %id, error = %e, "Cannot re-insert chunk"),
            }
        }

        if recovered > 0 {
            self.save()?;
            self.checkpoint.invalidate();
        }
        info!(recovered, total, "Index recovery complete");
        Ok(recovered)
    }
}
