//! End-to-end ingestion tests for kb-retrieval.
//!
//! Work source -> scheduler -> embed -> index, including per-item failure
//! isolation, the JSON-lines spool, crash recovery and the run loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use e2e_tests::{
    filler_corpus, ingest, lupus_corpus, test_settings, QuietSampler, TestHarness, TEST_DIMENSION,
};
use kb_embeddings::{Embedding, EmbeddingError, EmbeddingModel, HashingEmbedder, ModelInfo};
use kb_indexing::IngestProgress;
use kb_scheduler::{CycleOutcome, WorkItem};
use kb_service::AppContext;
use kb_vector::persistence::INDEX_FILE;

/// Fails on any text containing "corrupted".
struct FailsOnCorrupted {
    inner: HashingEmbedder,
}

#[async_trait]
impl EmbeddingModel for FailsOnCorrupted {
    fn info(&self) -> &ModelInfo {
        self.inner.info()
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.contains("corrupted") {
            return Err(EmbeddingError::InvalidResponse("NaN in embedding".to_string()));
        }
        self.inner.embed(text).await
    }
}

/// One of five items fails to embed: four are indexed, one is counted as a
/// failure, and the failed id stays out of the checkpoint set.
#[tokio::test]
async fn test_one_embedding_failure_in_five() {
    let harness = TestHarness::with_embedder(Arc::new(FailsOnCorrupted {
        inner: HashingEmbedder::new(TEST_DIMENSION),
    }))
    .await;
    let mut items = lupus_corpus();
    items[1].text = "corrupted extraction output from a scanned page".to_string();
    let failed_id = items[1].chunk_id.clone();
    harness.enqueue(items);

    let report = harness
        .ctx
        .scheduler()
        .run_cycle(&CancellationToken::new())
        .await;

    assert_eq!(report.outcome, CycleOutcome::Worked);
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(harness.knowledge_base().stats().unwrap().total, 4);

    let processed = harness.ctx.checkpoint().processed_ids(true).unwrap();
    assert_eq!(processed.len(), 4);
    assert!(!processed.contains(&failed_id));

    let progress = IngestProgress::load(&harness.ctx.settings().progress_path());
    assert_eq!(progress.processed_count, 4);
    assert_eq!(progress.failed_count, 1);
}

#[tokio::test]
async fn test_scheduler_drains_queue_then_idles() {
    let harness = TestHarness::with_settings(|s| s.scheduler.max_batch_size = 7).await;
    harness.enqueue(filler_corpus(20, 4));
    let scheduler = harness.ctx.scheduler();
    let token = CancellationToken::new();

    let mut batches = Vec::new();
    loop {
        let report = scheduler.run_cycle(&token).await;
        if report.outcome != CycleOutcome::Worked {
            assert_eq!(report.outcome, CycleOutcome::Idle);
            break;
        }
        batches.push(report.processed);
    }

    assert_eq!(batches, vec![7, 7, 6]);
    assert_eq!(harness.knowledge_base().stats().unwrap().total, 20);

    // Everything was saved as it went; a restart sees the same index.
    let reopened = harness.reopen().await;
    assert_eq!(reopened.knowledge_base().stats().unwrap().total, 20);
}

/// Chunks added through the query-side API are not ingested a second time.
#[tokio::test]
async fn test_scheduler_skips_chunks_already_indexed() {
    let harness = TestHarness::new().await;
    let corpus = lupus_corpus();
    ingest(harness.knowledge_base(), &corpus[..3]).await;
    harness.enqueue(corpus);

    let report = harness
        .ctx
        .scheduler()
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(report.processed, 2);
    assert_eq!(harness.knowledge_base().stats().unwrap().total, 5);
}

#[tokio::test]
async fn test_manual_deep_sleep_pauses_ingestion() {
    let harness = TestHarness::new().await;
    harness.enqueue(lupus_corpus());
    let admin = harness.ctx.admin();
    let scheduler = harness.ctx.scheduler();
    let token = CancellationToken::new();

    assert!(admin.force_deep_sleep().success);
    let report = scheduler.run_cycle(&token).await;
    assert_eq!(report.outcome, CycleOutcome::ManualDeepSleep);
    assert_eq!(harness.knowledge_base().stats().unwrap().total, 0);

    let status = admin.exit_deep_sleep().data.unwrap();
    assert!(!status.state.manual_override);
    let report = scheduler.run_cycle(&token).await;
    assert_eq!(report.outcome, CycleOutcome::Worked);
    assert_eq!(report.processed, 5);
}

/// The default work source is the JSON-lines spool in the data directory.
#[tokio::test]
async fn test_ingest_from_jsonl_spool() {
    let temp = tempfile::TempDir::new().unwrap();
    let settings = test_settings(temp.path());

    let mut lines: Vec<String> = lupus_corpus()
        .iter()
        .map(|item| serde_json::to_string(item).unwrap())
        .collect();
    lines.insert(2, "{ not a work item".to_string());
    std::fs::write(settings.spool_path(), lines.join("\n")).unwrap();

    let ctx = AppContext::builder(settings)
        .sampler(Box::new(QuietSampler))
        .build()
        .await
        .unwrap();

    let report = ctx.scheduler().run_cycle(&CancellationToken::new()).await;
    assert_eq!(report.outcome, CycleOutcome::Worked);
    assert_eq!(report.processed, 5);

    let results = ctx.knowledge_base().search("lupus", 3).await.unwrap();
    assert_eq!(results.len(), 3);
}

/// A lost vector file is rebuilt from the chunk store at startup.
#[tokio::test]
async fn test_lost_vector_file_is_reembedded() {
    let harness = TestHarness::new().await;
    let kb = harness.knowledge_base();
    ingest(kb, &lupus_corpus()).await;
    assert!(kb.save().unwrap().is_complete());
    let stats = kb.stats().unwrap();

    let index_file = harness.index_dir().join(INDEX_FILE);
    std::fs::remove_file(&index_file).unwrap();
    let _ = std::fs::remove_file(index_file.with_extension("vec.bak"));

    let reopened = harness.reopen().await;
    let kb = reopened.knowledge_base();
    assert_eq!(kb.stats().unwrap(), stats);
    assert!(index_file.exists());

    let results = kb.search("lupus", 3).await.unwrap();
    assert_eq!(results.len(), 3);
    let processed = reopened.checkpoint().processed_ids(true).unwrap();
    assert!(processed.contains("web-2"));
}

/// The run loop wakes on new work and persists before exiting.
#[tokio::test]
async fn test_run_loop_ingests_and_stops_on_cancel() {
    let harness = Arc::new(
        TestHarness::with_settings(|s| {
            s.scheduler.base_interval_secs = 30;
            s.scheduler.max_interval_secs = 60;
        })
        .await,
    );
    let token = CancellationToken::new();
    let handle = {
        let harness = harness.clone();
        let token = token.clone();
        tokio::spawn(async move { harness.ctx.run(token).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.enqueue(vec![WorkItem::new(
        "late-1",
        "A late arriving chunk about cutaneous lupus and photosensitivity.",
        kb_types::ChunkMetadata::new(kb_types::SourceType::Other),
    )]);
    harness.ctx.scheduler().notify_new_work();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while harness.knowledge_base().stats().unwrap().total == 0 {
        assert!(tokio::time::Instant::now() < deadline, "work was not picked up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    let progress = IngestProgress::load(&harness.ctx.settings().progress_path());
    assert_eq!(progress.processed_count, 1);
    assert_eq!(progress.last_chunk_id.as_deref(), Some("late-1"));

    let reopened = harness.reopen().await;
    assert_eq!(reopened.knowledge_base().stats().unwrap().total, 1);
}
