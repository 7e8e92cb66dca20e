//! Memory reclamation hooks.
//!
//! Anything holding a large buffer that can be rebuilt on demand registers
//! as a [`Reclaimable`]: the embedding cache, and the index itself through
//! [`IndexUnloader`].

use kb_embeddings::{CachedEmbedder, EmbeddingModel};
use kb_vector::{with_write, SharedIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

/// A component that can drop memory and rebuild it later.
pub trait Reclaimable: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released; returns the number of units freed.
    fn reclaim(&self) -> Result<usize, SchedulerError>;
}

impl<E: EmbeddingModel> Reclaimable for CachedEmbedder<E> {
    fn name(&self) -> &str {
        "embedding_cache"
    }

    fn reclaim(&self) -> Result<usize, SchedulerError> {
        Ok(self.clear())
    }
}

/// Unloads the shared index; it reloads on the next search or add.
pub struct IndexUnloader {
    index: SharedIndex,
}

impl IndexUnloader {
    pub fn new(index: SharedIndex) -> Self {
        Self { index }
    }
}

impl Reclaimable for IndexUnloader {
    fn name(&self) -> &str {
        "index"
    }

    fn reclaim(&self) -> Result<usize, SchedulerError> {
        with_write(&self.index, |index| {
            if !index.is_persistent() {
                debug!("Index has no data directory, not unloading");
                return Ok(0);
            }
            index.unload()
        })
        .map_err(|e| SchedulerError::Reclaim {
            name: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub released: Vec<(String, usize)>,
    pub failures: usize,
}

/// Run every reclaimer; failures are logged and counted.
pub fn reclaim_all<R>(reclaimers: &[R]) -> ReclaimReport
where
    R: AsRef<dyn Reclaimable>,
{
    let mut report = ReclaimReport::default();
    for reclaimer in reclaimers {
        let reclaimer = reclaimer.as_ref();
        match reclaimer.reclaim() {
            Ok(count) => report.released.push((reclaimer.name().to_string(), count)),
            Err(e) => {
                warn!(reclaimer = reclaimer.name(), error = %e, "Reclaim failed");
                report.failures += 1;
            }
        }
    }
    info!(
        released = ?report.released,
        failures = report.failures,
        "Memory reclamation pass complete"
    );
    report
}
