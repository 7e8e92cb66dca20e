//! End-to-end test infrastructure for kb-retrieval.
//!
//! Provides a shared [`TestHarness`] and corpus helpers for tests covering
//! the full ingest -> index -> search pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kb_embeddings::EmbeddingModel;
use kb_scheduler::{InMemoryWorkSource, ResourceSampler, ResourceSnapshot, WorkItem, WorkSource};
use kb_service::{AppContext, KnowledgeBase, Settings};
use kb_types::{ChunkMetadata, SourceType};

/// Embedding dimension used throughout the e2e suite.
pub const TEST_DIMENSION: usize = 64;

/// Reports a lightly loaded machine, so batch sizing is predictable.
pub struct QuietSampler;

impl ResourceSampler for QuietSampler {
    fn sample(&self) -> ResourceSnapshot {
        ResourceSnapshot::new(5.0, 20.0, 64 * 1024 * 1024)
    }
}

/// Shared test harness for E2E tests.
///
/// Owns a temp data directory and an [`AppContext`] built over it with the
/// hashing embedder, a quiet resource sampler and an in-memory work source.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub source: Arc<InMemoryWorkSource>,
    pub ctx: AppContext,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(|_| {}, None).await
    }

    /// Harness with settings adjusted before the context is built.
    pub async fn with_settings(adjust: impl FnOnce(&mut Settings)) -> Self {
        Self::build(adjust, None).await
    }

    /// Harness whose scheduler and knowledge base use `embedder`.
    pub async fn with_embedder(embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self::build(|_| {}, Some(embedder)).await
    }

    async fn build(
        adjust: impl FnOnce(&mut Settings),
        embedder: Option<Arc<dyn EmbeddingModel>>,
    ) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mut settings = test_settings(temp_dir.path());
        adjust(&mut settings);

        let source = Arc::new(InMemoryWorkSource::default());
        let mut builder = AppContext::builder(settings)
            .source(source.clone())
            .sampler(Box::new(QuietSampler));
        if let Some(embedder) = embedder {
            builder = builder.embedder(embedder);
        }
        let ctx = builder.build().await.expect("Failed to build app context");

        Self {
            _temp_dir: temp_dir,
            source,
            ctx,
        }
    }

    pub fn data_dir(&self) -> &Path {
        self._temp_dir.path()
    }

    pub fn index_dir(&self) -> PathBuf {
        self.ctx.settings().index_dir()
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        self.ctx.knowledge_base()
    }

    /// A second context over the same data directory, as a restarted
    /// process would see it.
    pub async fn reopen(&self) -> AppContext {
        AppContext::builder(self.ctx.settings().clone())
            .source(Arc::new(InMemoryWorkSource::default()) as Arc<dyn WorkSource>)
            .sampler(Box::new(QuietSampler))
            .build()
            .await
            .expect("Failed to reopen app context")
    }

    /// Queue items for the scheduler.
    pub fn enqueue(&self, items: impl IntoIterator<Item = WorkItem>) {
        for item in items {
            self.source.push(item);
        }
    }
}

/// Settings rooted at `data_dir` with fast scheduler intervals.
pub fn test_settings(data_dir: &Path) -> Settings {
    let mut settings = Settings {
        data_dir: data_dir.to_string_lossy().to_string(),
        ..Default::default()
    };
    settings.index.dimension = TEST_DIMENSION;
    settings.scheduler.base_interval_secs = 1;
    settings.scheduler.max_interval_secs = 8;
    settings.scheduler.upstream_initial_backoff_ms = 10;
    settings
}

/// Add items directly through the knowledge base; returns how many were new.
pub async fn ingest(kb: &KnowledgeBase, items: &[WorkItem]) -> usize {
    let mut added = 0;
    for item in items {
        let id = kb
            .add_chunk(&item.text, item.indexed_metadata())
            .await
            .expect("Failed to add chunk");
        if id.is_some() {
            added += 1;
        }
    }
    added
}

pub fn pdf_chunk(chunk_id: &str, document_id: &str, page: u32, text: &str) -> WorkItem {
    WorkItem::new(
        chunk_id,
        text,
        ChunkMetadata::new(SourceType::Pdf)
            .with_document_id(document_id)
            .with_file_path(format!("/library/{}.pdf", document_id))
            .with_page_number(page),
    )
}

pub fn website_chunk(chunk_id: &str, document_id: &str, url: &str, text: &str) -> WorkItem {
    WorkItem::new(
        chunk_id,
        text,
        ChunkMetadata::new(SourceType::Website)
            .with_document_id(document_id)
            .with_url(url),
    )
}

/// Three PDF chunks and two website chunks, all about lupus.
pub fn lupus_corpus() -> Vec<WorkItem> {
    vec![
        pdf_chunk(
            "pdf-1",
            "handbook",
            12,
            "Lupus is a chronic autoimmune disease in which the immune system attacks healthy tissue.",
        ),
        pdf_chunk(
            "pdf-2",
            "handbook",
            13,
            "Lupus nephritis is kidney inflammation caused by systemic lupus erythematosus.",
        ),
        pdf_chunk(
            "pdf-3",
            "trial-report",
            4,
            "Hydroxychloroquine remains first-line maintenance therapy for lupus patients.",
        ),
        website_chunk(
            "web-1",
            "site-lupus",
            "https://example.org/health-topics/lupus",
            "Overview: lupus symptoms include joint pain, fatigue and a butterfly-shaped rash.",
        ),
        website_chunk(
            "web-2",
            "site-lupus",
            "https://example.org/conditions/lupus/diagnosis",
            "Doctors diagnose lupus with blood tests such as ANA together with a physical exam.",
        ),
    ]
}

/// `count` filler chunks spread over `documents` documents.
pub fn filler_corpus(count: usize, documents: usize) -> Vec<WorkItem> {
    let topics = [
        "rheumatoid arthritis joint swelling",
        "psoriasis skin plaques treatment",
        "vasculitis blood vessel inflammation",
        "sjogren syndrome dry eyes and mouth",
        "scleroderma skin thickening",
    ];
    (0..count)
        .map(|n| {
            let doc = format!("doc-{}", n % documents.max(1));
            pdf_chunk(
                &format!("filler-{}", n),
                &doc,
                (n % 30) as u32 + 1,
                &format!("Chapter {} discusses {} in detail.", n, topics[n % topics.len()]),
            )
        })
        .collect()
}

/// Result ids in rank order.
pub fn ids(results: &[kb_retrieval::RankedChunk]) -> Vec<String> {
    results.iter().map(|r| r.id.clone()).collect()
}
