//! LRU embedding cache.
//!
//! Repeated queries and re-ingested text skip the provider round trip.
//! The cache is one of the auxiliary buffers dropped by the emergency
//! memory cleanup.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;

use crate::error::EmbeddingError;
use crate::model::{Embedding, EmbeddingModel, ModelInfo};

/// Caching wrapper around any embedding provider.
pub struct CachedEmbedder<E: EmbeddingModel> {
    inner: E,
    cache: Mutex<LruCache<String, Embedding>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<E: EmbeddingModel> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity.max(1)).expect("capacity must be > 0 after max(1)");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since construction.
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Drop every cached vector. Returns the number of entries released.
    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        let released = cache.len();
        cache.clear();
        debug!(released, "Cleared embedding cache");
        released
    }
}

#[async_trait]
impl<E: EmbeddingModel> EmbeddingModel for CachedEmbedder<E> {
    fn info(&self) -> &ModelInfo {
        self.inner.info()
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let cached = {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            cache.get(text).cloned()
        };
        if let Some(embedding) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(embedding);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        // Errors are not cached; the next attempt goes to the provider again
        let embedding = self.inner.embed(text).await?;
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}
