//! Processed-id tracking.
//!
//! The set of upstream chunk ids already indexed is rebuilt from the chunk
//! store and cached for a TTL. Newly processed ids are added to the cached
//! set directly; admin removals call [`CheckpointTracker::invalidate`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kb_vector::{with_read, SharedIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexingError;

/// Checkpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Seconds a scanned id set stays valid
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

struct CachedIds {
    ids: Arc<HashSet<String>>,
    scanned_at: Instant,
}

/// TTL-cached view of which upstream ids are already indexed.
pub struct CheckpointTracker {
    index: SharedIndex,
    ttl: Duration,
    cache: Mutex<Option<CachedIds>>,
}

impl CheckpointTracker {
    pub fn new(index: SharedIndex, config: &CheckpointConfig) -> Self {
        Self {
            index,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: Mutex::new(None),
        }
    }

    pub fn with_ttl(index: SharedIndex, ttl: Duration) -> Self {
        Self {
            index,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Processed ids, rescanning the store when stale or when forced.
    pub fn processed_ids(
        &self,
        force_refresh: bool,
    ) -> Result<Arc<HashSet<String>>, IndexingError> {
        if !force_refresh {
            let cache = self.cache.lock().expect("checkpoint cache mutex poisoned");
            if let Some(entry) = cache.as_ref() {
                if entry.scanned_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&entry.ids));
                }
            }
        }

        // Read-only scan; an unloaded index answers from ids captured at unload
        let ids = Arc::new(with_read(&self.index, |index| index.upstream_ids())?);
        debug!(count = ids.len(), forced = force_refresh, "Rescanned processed ids");

        let mut cache = self.cache.lock().expect("checkpoint cache mutex poisoned");
        *cache = Some(CachedIds {
            ids: Arc::clone(&ids),
            scanned_at: Instant::now(),
        });
        Ok(ids)
    }

    pub fn is_processed(&self, chunk_id: &str) -> Result<bool, IndexingError> {
        Ok(self.processed_ids(false)?.contains(chunk_id))
    }

    /// Record a success without waiting for the next rescan.
    pub fn mark_processed(&self, chunk_id: &str) {
        let mut cache = self.cache.lock().expect("checkpoint cache mutex poisoned");
        if let Some(entry) = cache.as_mut() {
            Arc::make_mut(&mut entry.ids).insert(chunk_id.to_string());
        }
    }

    /// Force the next call to rescan.
    pub fn invalidate(&self) {
        *self.cache.lock().expect("checkpoint cache mutex poisoned") = None;
    }
}
