//! The ingestion loop.
//!
//! [`IngestionScheduler::run`] owns the only write path into the index while
//! it runs. Operator commands (`force_deep_sleep`, `exit_deep_sleep`,
//! `notify_new_work`) update the state under its mutex and wake the loop
//! through a [`Notify`] so a long sleep is cut short.
//!
//! Items that fail to embed are held back by a [`RetryLedger`] so a chunk
//! the embedder always rejects cannot fill every batch, and a cycle with no
//! successes backs off like an idle one.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use backoff::{backoff::Backoff, ExponentialBackoff};
use kb_embeddings::{Embedding, EmbeddingError, EmbeddingModel};
use kb_indexing::{CheckpointTracker, IngestProgress};
use kb_types::Chunk;
use kb_vector::{with_read, with_write, SharedIndex};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::monitor::{ResourceMonitor, ResourceSnapshot};
use crate::reclaim::{reclaim_all, ReclaimReport, Reclaimable};
use crate::retry::RetryLedger;
use crate::source::{FetchRequest, WorkItem, WorkSource};
use crate::state::{IdleTransition, SchedulerPhase, SchedulerState};

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub index: SharedIndex,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub source: Arc<dyn WorkSource>,
    pub checkpoint: Arc<CheckpointTracker>,
    pub monitor: Arc<ResourceMonitor>,
    /// Run on deep sleep entry, in manual deep sleep and in emergencies
    pub reclaimers: Vec<Arc<dyn Reclaimable>>,
    /// Where [`IngestProgress`] is persisted, if anywhere
    pub progress_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Items were taken from the source or recovered from the store
    Worked,
    /// Nothing new upstream
    Idle,
    /// The configured completion target is met
    TargetReached,
    /// The source could not be reached within the retry budget
    UpstreamUnavailable,
    /// Processing suspended by the operator
    ManualDeepSleep,
    /// Cancelled before the cycle started
    Cancelled,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Set when the cycle counted as idle, including a worked cycle with
    /// no successes
    pub transition: Option<IdleTransition>,
    pub batch_size: usize,
    pub processed: usize,
    pub failed: usize,
    /// Stored chunks that got their vector back this cycle
    pub recovered: usize,
    /// Present when a reclamation pass ran
    pub cleanup: Option<ReclaimReport>,
}

impl CycleReport {
    fn new(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            transition: None,
            batch_size: 0,
            processed: 0,
            failed: 0,
            recovered: 0,
            cleanup: None,
        }
    }
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    pub state: SchedulerState,
    pub progress: IngestProgress,
    pub last_cycle: Option<CycleReport>,
    pub last_snapshot: Option<ResourceSnapshot>,
    /// Seconds until another emergency cleanup is allowed
    pub cleanup_cooldown_secs: Option<u64>,
    /// Failed items waiting for a retry
    pub failed_items: usize,
}

pub struct IngestionScheduler {
    config: SchedulerConfig,
    deps: SchedulerDeps,
    state: Mutex<SchedulerState>,
    progress: Mutex<IngestProgress>,
    last_cycle: Mutex<Option<CycleReport>>,
    retries: Mutex<RetryLedger>,
    wake: Notify,
}

impl IngestionScheduler {
    /// Build a scheduler; progress is resumed from `deps.progress_path`.
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Result<Self, SchedulerError> {
        config.validate()?;
        let progress = deps
            .progress_path
            .as_deref()
            .map(IngestProgress::load)
            .unwrap_or_default();
        if progress.processed_count > 0 {
            info!(
                processed = progress.processed_count,
                failed = progress.failed_count,
                "Resuming ingestion progress"
            );
        }

        Ok(Self {
            state: Mutex::new(SchedulerState::new(&config)),
            progress: Mutex::new(progress),
            last_cycle: Mutex::new(None),
            retries: Mutex::new(RetryLedger::new(
                config.failed_retry_interval(),
                config.deep_sleep_interval(),
            )),
            wake: Notify::new(),
            config,
            deps,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler state mutex poisoned")
    }

    fn lock_retries(&self) -> std::sync::MutexGuard<'_, RetryLedger> {
        self.retries.lock().expect("retry ledger mutex poisoned")
    }

    /// Run cycles until `token` is cancelled, then persist and return.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), SchedulerError> {
        {
            let mut state = self.lock_state();
            if state.running {
                return Err(SchedulerError::AlreadyRunning);
            }
            state.running = true;
        }
        info!(
            base_interval_secs = self.config.base_interval_secs,
            max_batch = self.config.max_batch_size,
            shard = ?self.config.shard,
            "Ingestion scheduler started"
        );

        loop {
            let report = self.run_cycle(&token).await;
            if report.outcome == CycleOutcome::Cancelled {
                break;
            }

            let (interval, phase) = {
                let state = self.lock_state();
                (state.sleep_interval, state.phase())
            };
            debug!(
                outcome = ?report.outcome,
                processed = report.processed,
                failed = report.failed,
                phase = %phase,
                sleep_secs = interval.as_secs_f64(),
                "Cycle complete"
            );

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => debug!("Scheduler woken"),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.save_index();
        self.save_progress();
        self.lock_state().running = false;
        info!("Ingestion scheduler stopped");
        Ok(())
    }

    /// One pass: sample, clean up if needed, fetch, process.
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleReport {
        let report = self.cycle(token).await;
        *self.last_cycle.lock().expect("last cycle mutex poisoned") = Some(report.clone());
        report
    }

    async fn cycle(&self, token: &CancellationToken) -> CycleReport {
        if token.is_cancelled() {
            return CycleReport::new(CycleOutcome::Cancelled);
        }

        let monitor = &self.deps.monitor;
        let snapshot = monitor.sample_now();
        let emergency = if monitor.is_critical(&snapshot) {
            warn!(
                memory_percent = snapshot.memory_percent,
                rss_bytes = snapshot.rss_bytes,
                "Critical resource condition"
            );
            monitor.emergency_cleanup(&self.deps.reclaimers)
        } else {
            None
        };

        if self.lock_state().manual_override {
            let mut report = CycleReport::new(CycleOutcome::ManualDeepSleep);
            report.cleanup = emergency.or_else(|| Some(reclaim_all(&self.deps.reclaimers)));
            return report;
        }

        if self.target_reached().await {
            let mut report = self.idle(CycleOutcome::TargetReached);
            report.cleanup = report.cleanup.or(emergency);
            return report;
        }

        let decision = monitor.classify(&snapshot);
        let limit = decision.batch_size.min(self.config.max_batch_size).max(1);
        if decision.limited {
            info!(
                cpu = snapshot.cpu_percent,
                memory = snapshot.memory_percent,
                "High load, processing one item"
            );
        }

        let deferred = self.lock_retries().deferred(Instant::now());
        let (recovered, unrecovered) = self.reembed_pending(limit, &deferred, token).await;
        let remaining = limit.saturating_sub(recovered + unrecovered);

        let items = if remaining == 0 {
            Vec::new()
        } else {
            match self.fetch_unprocessed(&deferred, remaining).await {
                Ok(items) => items,
                Err(e) => {
                    error!(error = %e, "Work source unavailable");
                    if recovered + unrecovered == 0 {
                        return self.idle(CycleOutcome::UpstreamUnavailable);
                    }
                    Vec::new()
                }
            }
        };

        if items.is_empty() && recovered + unrecovered == 0 {
            let mut report = self.idle(CycleOutcome::Idle);
            report.cleanup = report.cleanup.or(emergency);
            return report;
        }

        let (ok, failed) = if items.is_empty() {
            (0, 0)
        } else {
            self.process_items(items, token).await
        };

        let mut report = if ok + recovered > 0 {
            if self.lock_state().on_work(&self.config) {
                info!("Work found, leaving deep sleep");
            }
            CycleReport::new(CycleOutcome::Worked)
        } else {
            // No success: count as idle
            let report = self.idle(CycleOutcome::Worked);
            warn!(failed = failed + unrecovered, "No item succeeded this cycle");
            report
        };
        report.batch_size = limit;
        report.cleanup = report.cleanup.or(emergency);
        report.processed = ok;
        report.failed = failed + unrecovered;
        report.recovered = recovered;
        report
    }

    fn idle(&self, outcome: CycleOutcome) -> CycleReport {
        let transition = self.lock_state().on_idle(&self.config);
        let mut report = CycleReport::new(outcome);
        report.transition = Some(transition);

        if transition == IdleTransition::EnteredDeepSleep {
            info!(
                idle_cycles = self.config.idle_cycles_before_deep_sleep,
                interval_secs = self.config.deep_sleep_interval_secs,
                "Entering deep sleep"
            );
            report.cleanup = Some(reclaim_all(&self.deps.reclaimers));
        }
        report
    }

    async fn target_reached(&self) -> bool {
        let Some(target) = self.config.target_completion else {
            return false;
        };
        match self.deps.source.total().await {
            Ok(Some(total)) => {
                let completion = self
                    .progress
                    .lock()
                    .expect("progress mutex poisoned")
                    .completion(total);
                if completion >= target {
                    debug!(completion, target, "Completion target reached");
                    return true;
                }
                false
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Cannot size work source for completion target");
                false
            }
        }
    }

    /// Items the checkpoint and retry ledger allow, up to `limit`.
    async fn fetch_unprocessed(
        &self,
        deferred: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, SchedulerError> {
        let processed = self.deps.checkpoint.processed_ids(false)?;
        let request = FetchRequest {
            processed: processed.as_ref(),
            deferred,
            limit,
            shard: self.config.shard,
        };
        let mut items = self.fetch_with_retry(request).await?;
        items.retain(|item| request.wants(&item.chunk_id));
        items.truncate(limit);
        Ok(items)
    }

    /// Fetch with bounded exponential backoff on connection errors.
    async fn fetch_with_retry(
        &self,
        request: FetchRequest<'_>,
    ) -> Result<Vec<WorkItem>, SchedulerError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.upstream_initial_backoff(),
            current_interval: self.config.upstream_initial_backoff(),
            max_elapsed_time: None,
            ..Default::default()
        };
        let max_attempts = self.config.upstream_max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.deps.source.fetch_unprocessed(request).await {
                Ok(items) => return Ok(items),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempts >= max_attempts {
                        return Err(e);
                    }
                    match backoff.next_backoff() {
                        Some(duration) => {
                            warn!(
                                error = %e,
                                attempt = attempts,
                                retry_in_ms = duration.as_millis(),
                                "Work source fetch failed, retrying"
                            );
                            tokio::time::sleep(duration).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }

    async fn embed(&self, text: &str) -> Result<Embedding, SchedulerError> {
        let timeout = self.config.embed_timeout();
        let embedding = tokio::time::timeout(timeout, self.deps.embedder.embed(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(timeout.as_secs()))??;
        Ok(embedding)
    }

    /// Give stored chunks whose vectors were lost a new vector, up to
    /// `limit` per cycle. Returns (recovered, failed).
    async fn reembed_pending(
        &self,
        limit: usize,
        deferred: &HashSet<String>,
        token: &CancellationToken,
    ) -> (usize, usize) {
        let pending: Vec<Chunk> = match with_read(&self.deps.index, |index| {
            index
                .pending_reembed()
                .iter()
                .filter(|c| !deferred.contains(&c.id))
                .take(limit)
                .cloned()
                .collect()
        }) {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Cannot read pending chunks");
                return (0, 0);
            }
        };
        if pending.is_empty() {
            return (0, 0);
        }

        let mut recovered = 0;
        let mut failed = 0;
        for chunk in pending {
            if token.is_cancelled() {
                break;
            }
            let id = chunk.id.clone();
            let result = match self.embed(&chunk.text).await {
                Ok(embedding) => with_write(&self.deps.index, |index| {
                    index.add_existing(chunk, &embedding)
                })
                .map_err(SchedulerError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.lock_retries().record_success(&id);
                    recovered += 1;
                }
                Err(e) => {
                    let (attempts, retry_in) =
                        self.lock_retries().record_failure(&id, Instant::now());
                    warn!(
                        id = %id,
                        attempts,
                        retry_in_secs = retry_in.as_secs(),
                        error = %e,
                        "Cannot re-embed stored chunk"
                    );
                    failed += 1;
                }
            }
        }

        if recovered > 0 {
            self.save_index();
        }
        info!(recovered, failed, "Re-embedded stored chunks");
        (recovered, failed)
    }

    /// Embed and index each item. Returns (processed, failed).
    async fn process_items(
        &self,
        items: Vec<WorkItem>,
        token: &CancellationToken,
    ) -> (usize, usize) {
        let total = items.len();
        let mut processed = 0;
        let mut failed = 0;
        let mut since_save = 0;

        for item in items {
            if token.is_cancelled() {
                info!(processed, remaining = total - processed - failed, "Batch interrupted");
                break;
            }

            match self.ingest(&item).await {
                Ok(Some(id)) => {
                    debug!(chunk_id = %item.chunk_id, id = %id, "Indexed chunk");
                    self.deps.checkpoint.mark_processed(&item.chunk_id);
                    self.lock_retries().record_success(&item.chunk_id);
                    self.progress
                        .lock()
                        .expect("progress mutex poisoned")
                        .record_success(item.chunk_id.as_str());
                    processed += 1;
                    since_save += 1;
                }
                Ok(None) => {
                    debug!(chunk_id = %item.chunk_id, "Already indexed");
                    self.deps.checkpoint.mark_processed(&item.chunk_id);
                    self.lock_retries().record_success(&item.chunk_id);
                }
                Err(e) => {
                    let (attempts, retry_in) = self
                        .lock_retries()
                        .record_failure(&item.chunk_id, Instant::now());
                    warn!(
                        chunk_id = %item.chunk_id,
                        document_id = item.metadata.document_id.as_deref().unwrap_or("-"),
                        attempts,
                        retry_in_secs = retry_in.as_secs(),
                        error = %e,
                        "Failed to ingest chunk"
                    );
                    self.progress
                        .lock()
                        .expect("progress mutex poisoned")
                        .record_failure();
                    failed += 1;
                }
            }

            if since_save >= self.config.save_every {
                self.save_index();
                since_save = 0;
            }
        }

        if since_save > 0 {
            self.save_index();
        }
        self.save_progress();
        info!(processed, failed, batch = total, "Batch complete");
        (processed, failed)
    }

    /// Returns the new chunk id, or None if the upstream id is already indexed.
    async fn ingest(&self, item: &WorkItem) -> Result<Option<String>, SchedulerError> {
        let embedding = self.embed(&item.text).await?;

        let metadata = item.indexed_metadata();
        let id = with_write(&self.deps.index, |index| {
            if index.contains_upstream(&item.chunk_id) {
                return Ok(None);
            }
            index.add(&item.text, &embedding, metadata).map(Some)
        })?;
        Ok(id)
    }

    fn save_index(&self) {
        let saved = with_read(&self.deps.index, |index| {
            index.is_persistent().then(|| index.save())
        });
        match saved {
            Ok(Some(report)) if !report.is_complete() => {
                warn!(
                    index_saved = report.index_saved,
                    store_saved = report.store_saved,
                    "Index snapshot incomplete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Cannot save index"),
        }
    }

    fn save_progress(&self) {
        let Some(path) = self.deps.progress_path.as_deref() else {
            return;
        };
        let progress = self.progress.lock().expect("progress mutex poisoned").clone();
        if let Err(e) = progress.save(path) {
            warn!(path = ?path, error = %e, "Cannot save ingestion progress");
        }
    }

    /// Suspend processing until [`Self::exit_deep_sleep`].
    pub fn force_deep_sleep(&self) {
        self.lock_state().enter_manual_deep_sleep(&self.config);
        info!("Manual deep sleep requested");
        self.wake.notify_one();
    }

    /// Release manual deep sleep and resume at the base interval.
    pub fn exit_deep_sleep(&self) {
        self.lock_state().exit_manual_deep_sleep(&self.config);
        info!("Manual deep sleep released");
        self.wake.notify_one();
    }

    /// Announce new upstream work; wakes the loop from backoff or deep sleep.
    pub fn notify_new_work(&self) {
        self.lock_state().wake(&self.config);
        self.wake.notify_one();
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock_state().clone();
        SchedulerStatus {
            phase: state.phase(),
            state,
            progress: self.progress.lock().expect("progress mutex poisoned").clone(),
            last_cycle: self
                .last_cycle
                .lock()
                .expect("last cycle mutex poisoned")
                .clone(),
            last_snapshot: self.deps.monitor.latest(),
            cleanup_cooldown_secs: self
                .deps
                .monitor
                .cooldown_remaining()
                .map(|d| d.as_secs()),
            failed_items: self.lock_retries().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use kb_embeddings::{CachedEmbedder, Embedding, HashingEmbedder, ModelInfo};
    use kb_indexing::{CheckpointConfig, PROGRESS_FILE};
    use kb_types::{ChunkMetadata, SourceType};
    use kb_vector::{ChunkIndex, ChunkIndexConfig};
    use tempfile::TempDir;

    use crate::config::MonitorConfig;
    use crate::monitor::ResourceSampler;
    use crate::source::InMemoryWorkSource;

    const DIM: usize = 16;

    struct Fixed {
        memory_percent: f32,
    }

    impl ResourceSampler for Fixed {
        fn sample(&self) -> ResourceSnapshot {
            ResourceSnapshot::new(5.0, self.memory_percent, 1_000_000)
        }
    }

    /// Hashing embedder that fails on texts containing "poison" and stalls
    /// on texts containing "stall".
    struct Flaky {
        inner: HashingEmbedder,
    }

    #[async_trait]
    impl EmbeddingModel for Flaky {
        fn info(&self) -> &ModelInfo {
            self.inner.info()
        }

        async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
            if text.contains("poison") {
                return Err(EmbeddingError::Unavailable("model crashed".to_string()));
            }
            if text.contains("stall") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.inner.embed_sync(text))
        }
    }

    /// Fails with a connection error a fixed number of times.
    struct Unreliable {
        inner: InMemoryWorkSource,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkSource for Unreliable {
        async fn fetch_unprocessed(
            &self,
            request: FetchRequest<'_>,
        ) -> Result<Vec<WorkItem>, SchedulerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SchedulerError::UpstreamConnection("refused".to_string()));
            }
            self.inner.fetch_unprocessed(request).await
        }
    }

    fn item(n: usize) -> WorkItem {
        WorkItem::new(
            format!("up-{}", n),
            format!("chunk number {} about lupus nephritis treatment", n),
            ChunkMetadata::new(SourceType::Pdf).with_document_id(format!("doc-{}", n % 2)),
        )
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            base_interval_secs: 10,
            max_interval_secs: 60,
            idle_cycles_before_deep_sleep: 3,
            deep_sleep_interval_secs: 3600,
            upstream_initial_backoff_ms: 10,
            ..Default::default()
        }
    }

    struct Fixture {
        scheduler: IngestionScheduler,
        index: SharedIndex,
        checkpoint: Arc<CheckpointTracker>,
    }

    fn fixture_with(
        config: SchedulerConfig,
        source: Arc<dyn WorkSource>,
        memory_percent: f32,
        progress_path: Option<PathBuf>,
    ) -> Fixture {
        let index = ChunkIndex::in_memory(DIM).unwrap().into_shared();
        fixture_on(index, config, source, memory_percent, progress_path)
    }

    fn fixture_on(
        index: SharedIndex,
        config: SchedulerConfig,
        source: Arc<dyn WorkSource>,
        memory_percent: f32,
        progress_path: Option<PathBuf>,
    ) -> Fixture {
        let checkpoint = Arc::new(CheckpointTracker::new(
            index.clone(),
            &CheckpointConfig::default(),
        ));
        let cache: Arc<dyn Reclaimable> =
            Arc::new(CachedEmbedder::new(HashingEmbedder::new(DIM), 8));
        let deps = SchedulerDeps {
            index: index.clone(),
            embedder: Arc::new(Flaky {
                inner: HashingEmbedder::new(DIM),
            }),
            source,
            checkpoint: checkpoint.clone(),
            monitor: Arc::new(ResourceMonitor::new(
                MonitorConfig::default(),
                Box::new(Fixed { memory_percent }),
            )),
            reclaimers: vec![cache],
            progress_path,
        };
        Fixture {
            scheduler: IngestionScheduler::new(config, deps).unwrap(),
            index,
            checkpoint,
        }
    }

    fn fixture(items: Vec<WorkItem>) -> Fixture {
        fixture_with(
            config(),
            Arc::new(InMemoryWorkSource::new(items)),
            20.0,
            None,
        )
    }

    fn indexed(index: &SharedIndex) -> usize {
        index.read().unwrap().len()
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_batch() {
        let mut items: Vec<WorkItem> = (0..5).map(item).collect();
        items[2].text = "this chunk will poison the embedder".to_string();
        let f = fixture(items);

        let report = f.scheduler.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Worked);
        assert_eq!(report.processed, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(indexed(&f.index), 4);

        let ids = f.checkpoint.processed_ids(true).unwrap();
        assert!(!ids.contains("up-2"));
        assert!(ids.contains("up-4"));

        let status = f.scheduler.status();
        assert_eq!(status.progress.processed_count, 4);
        assert_eq!(status.progress.failed_count, 1);
    }

    #[tokio::test]
    async fn test_second_cycle_is_idle() {
        let f = fixture((0..3).map(item).collect());
        let token = CancellationToken::new();

        f.scheduler.run_cycle(&token).await;
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert_eq!(report.transition, Some(IdleTransition::Backoff));
        assert_eq!(indexed(&f.index), 3);
    }

    #[tokio::test]
    async fn test_idle_cycles_enter_deep_sleep() {
        let f = fixture(Vec::new());
        let token = CancellationToken::new();

        for _ in 0..2 {
            let report = f.scheduler.run_cycle(&token).await;
            assert_eq!(report.transition, Some(IdleTransition::Backoff));
            assert!(report.cleanup.is_none());
        }
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.transition, Some(IdleTransition::EnteredDeepSleep));
        assert!(report.cleanup.is_some());

        let status = f.scheduler.status();
        assert_eq!(status.phase, SchedulerPhase::Stopped);
        assert!(status.state.in_deep_sleep);
        assert_eq!(status.state.sleep_interval, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_work_leaves_deep_sleep() {
        let source = Arc::new(InMemoryWorkSource::default());
        let f = fixture_with(config(), source.clone(), 20.0, None);
        let token = CancellationToken::new();
        for _ in 0..3 {
            f.scheduler.run_cycle(&token).await;
        }
        assert!(f.scheduler.status().state.in_deep_sleep);

        source.push(item(1));
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::Worked);
        let state = f.scheduler.status().state;
        assert!(!state.in_deep_sleep);
        assert_eq!(state.consecutive_idle_cycles, 0);
        assert_eq!(state.sleep_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_notify_new_work_wakes() {
        let f = fixture(Vec::new());
        let token = CancellationToken::new();
        for _ in 0..3 {
            f.scheduler.run_cycle(&token).await;
        }
        f.scheduler.notify_new_work();
        let state = f.scheduler.status().state;
        assert!(!state.in_deep_sleep);
        assert_eq!(state.sleep_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_manual_deep_sleep_skips_work() {
        let f = fixture((0..3).map(item).collect());
        let token = CancellationToken::new();

        f.scheduler.force_deep_sleep();
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::ManualDeepSleep);
        assert!(report.cleanup.is_some());
        assert_eq!(indexed(&f.index), 0);

        f.scheduler.notify_new_work();
        assert!(f.scheduler.status().state.manual_override);

        f.scheduler.exit_deep_sleep();
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.processed, 3);
    }

    #[tokio::test]
    async fn test_high_memory_triggers_emergency_cleanup() {
        let f = fixture_with(
            config(),
            Arc::new(InMemoryWorkSource::new(vec![item(1)])),
            95.0,
            None,
        );
        let token = CancellationToken::new();

        let report = f.scheduler.run_cycle(&token).await;
        assert!(report.cleanup.is_some());
        // High load still processes, one item at a time
        assert_eq!(report.batch_size, 1);
        assert_eq!(report.processed, 1);

        let report = f.scheduler.run_cycle(&token).await;
        assert!(report.cleanup.is_none());
        assert!(f.scheduler.status().cleanup_cooldown_secs.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_retry_recovers() {
        let source = Arc::new(Unreliable {
            inner: InMemoryWorkSource::new(vec![item(1)]),
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let f = fixture_with(config(), source.clone(), 20.0, None);

        let report = f.scheduler.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Worked);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_retry_is_bounded() {
        let source = Arc::new(Unreliable {
            inner: InMemoryWorkSource::new(vec![item(1)]),
            failures_left: AtomicUsize::new(100),
            calls: AtomicUsize::new(0),
        });
        let f = fixture_with(config(), source.clone(), 20.0, None);

        let report = f.scheduler.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::UpstreamUnavailable);
        assert_eq!(report.transition, Some(IdleTransition::Backoff));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_timeout_counts_as_failure() {
        let mut stalled = item(7);
        stalled.text = "this chunk will stall the embedder".to_string();
        let f = fixture(vec![item(1), stalled]);

        let report = f.scheduler.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_target_completion_stops_ingestion() {
        let config = SchedulerConfig {
            max_batch_size: 2,
            target_completion: Some(0.5),
            ..config()
        };
        let f = fixture_with(
            config,
            Arc::new(InMemoryWorkSource::new((0..4).map(item).collect())),
            20.0,
            None,
        );
        let token = CancellationToken::new();

        assert_eq!(f.scheduler.run_cycle(&token).await.processed, 2);
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::TargetReached);
        assert_eq!(indexed(&f.index), 2);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_cycle() {
        let f = fixture(vec![item(1)]);
        let token = CancellationToken::new();
        token.cancel();
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(indexed(&f.index), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled_persists() {
        let temp = TempDir::new().unwrap();
        let progress_path = temp.path().join(PROGRESS_FILE);
        let index = ChunkIndex::open(ChunkIndexConfig::new(DIM).with_data_dir(temp.path()))
            .unwrap()
            .into_shared();
        let checkpoint = Arc::new(CheckpointTracker::new(
            index.clone(),
            &CheckpointConfig::default(),
        ));
        let deps = SchedulerDeps {
            index: index.clone(),
            embedder: Arc::new(HashingEmbedder::new(DIM)),
            source: Arc::new(InMemoryWorkSource::new((0..3).map(item).collect())),
            checkpoint,
            monitor: Arc::new(ResourceMonitor::new(
                MonitorConfig::default(),
                Box::new(Fixed {
                    memory_percent: 20.0,
                }),
            )),
            reclaimers: Vec::new(),
            progress_path: Some(progress_path.clone()),
        };
        let scheduler = Arc::new(IngestionScheduler::new(config(), deps).unwrap());
        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(token.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(scheduler.status().phase, SchedulerPhase::Backoff);
        assert!(matches!(
            scheduler.clone().run(token.clone()).await,
            Err(SchedulerError::AlreadyRunning)
        ));

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(scheduler.status().phase, SchedulerPhase::Stopped);

        assert_eq!(IngestProgress::load(&progress_path).processed_count, 3);
        let reopened = ChunkIndex::open(ChunkIndexConfig::new(DIM).with_data_dir(temp.path())).unwrap();
        assert_eq!(reopened.len(), 3);
    }

    #[tokio::test]
    async fn test_poisoned_item_does_not_block_queue() {
        let config = SchedulerConfig {
            max_batch_size: 1,
            ..config()
        };
        let mut items: Vec<WorkItem> = (0..3).map(item).collect();
        items[0].text = "this chunk will poison the embedder".to_string();
        let f = fixture_with(config, Arc::new(InMemoryWorkSource::new(items)), 20.0, None);
        let token = CancellationToken::new();

        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::Worked);
        assert_eq!(report.failed, 1);
        // Nothing succeeded, so the cycle backs off
        assert_eq!(report.transition, Some(IdleTransition::Backoff));

        for _ in 0..2 {
            let report = f.scheduler.run_cycle(&token).await;
            assert_eq!(report.processed, 1);
            assert_eq!(report.failed, 0);
            assert!(report.transition.is_none());
        }
        assert_eq!(indexed(&f.index), 2);

        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert_eq!(f.scheduler.status().failed_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_retried_after_delay() {
        let config = SchedulerConfig {
            failed_retry_secs: 60,
            ..config()
        };
        let mut poisoned = item(0);
        poisoned.text = "this chunk will poison the embedder".to_string();
        let f = fixture_with(
            config,
            Arc::new(InMemoryWorkSource::new(vec![poisoned])),
            20.0,
            None,
        );
        let token = CancellationToken::new();

        assert_eq!(f.scheduler.run_cycle(&token).await.failed, 1);
        assert_eq!(f.scheduler.run_cycle(&token).await.outcome, CycleOutcome::Idle);

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = f.scheduler.run_cycle(&token).await;
        assert_eq!(report.failed, 1);
        // Three cycles without a success
        assert_eq!(report.transition, Some(IdleTransition::EnteredDeepSleep));

        // Second delay is doubled
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(f.scheduler.run_cycle(&token).await.outcome, CycleOutcome::Idle);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(f.scheduler.run_cycle(&token).await.failed, 1);
    }

    #[tokio::test]
    async fn test_cycle_reembeds_pending_chunks() {
        let temp = TempDir::new().unwrap();
        let embedder = HashingEmbedder::new(DIM);
        {
            let mut index =
                ChunkIndex::open(ChunkIndexConfig::new(DIM).with_data_dir(temp.path())).unwrap();
            for n in 0..3 {
                let text = format!("stored chunk {} about renal biopsy", n);
                index
                    .add(&text, &embedder.embed_sync(&text), ChunkMetadata::new(SourceType::Pdf))
                    .unwrap();
            }
            assert!(index.save().is_complete());
        }
        let snapshots = kb_vector::SnapshotStore::new(temp.path());
        std::fs::write(snapshots.index_path(), b"corrupt").unwrap();
        std::fs::remove_file(temp.path().join("index.vec.bak")).ok();

        let index = ChunkIndex::open(ChunkIndexConfig::new(DIM).with_data_dir(temp.path()))
            .unwrap()
            .into_shared();
        assert_eq!(index.read().unwrap().pending_reembed().len(), 3);
        let f = fixture_on(
            index,
            config(),
            Arc::new(InMemoryWorkSource::default()),
            20.0,
            None,
        );

        let report = f.scheduler.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Worked);
        assert_eq!(report.recovered, 3);
        assert!(report.transition.is_none());
        assert_eq!(indexed(&f.index), 3);
        assert!(f.index.read().unwrap().pending_reembed().is_empty());

        let reopened =
            ChunkIndex::open(ChunkIndexConfig::new(DIM).with_data_dir(temp.path())).unwrap();
        assert_eq!(reopened.len(), 3);
        assert!(reopened.pending_reembed().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SchedulerConfig {
            max_batch_size: 0,
            ..config()
        };
        let index = ChunkIndex::in_memory(DIM).unwrap().into_shared();
        let deps = SchedulerDeps {
            index: index.clone(),
            embedder: Arc::new(HashingEmbedder::new(DIM)),
            source: Arc::new(InMemoryWorkSource::default()),
            checkpoint: Arc::new(CheckpointTracker::new(index, &CheckpointConfig::default())),
            monitor: Arc::new(ResourceMonitor::new(
                MonitorConfig::default(),
                Box::new(Fixed {
                    memory_percent: 20.0,
                }),
            )),
            reclaimers: Vec::new(),
            progress_path: None,
        };
        assert!(matches!(
            IngestionScheduler::new(config, deps),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }
}
