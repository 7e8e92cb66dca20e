use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use e2e_tests::{test_settings, QuietSampler};
use kb_scheduler::{CycleOutcome, InMemoryWorkSource, WorkItem};
use kb_service::AppContext;
use kb_types::{ChunkMetadata, SourceType};
use kb_vector::IndexKind;

const VOCABULARY: [&str; 24] = [
    "lupus", "nephritis", "kidney", "rash", "fatigue", "joint", "arthritis", "biopsy",
    "antibody", "steroid", "flare", "remission", "dosage", "trial", "cohort", "symptom",
    "diagnosis", "treatment", "immune", "inflammation", "skin", "blood", "urine", "protein",
];

#[derive(Parser, Debug)]
#[command(name = "perf_bench", about = "kb-retrieval performance benchmark harness")]
struct Args {
    #[arg(long, default_value_t = 2_000)]
    chunks: usize,
    #[arg(long, default_value_t = 200)]
    queries: usize,
    #[arg(long, value_enum, default_value = "flat")]
    kind: Backend,
    #[arg(long, default_value_t = 384)]
    dimension: usize,
    #[arg(long, default_value_t = 10)]
    top_k: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Write the JSON report here as well as to stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Serialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum Backend {
    Flat,
    Hnsw,
}

impl From<Backend> for IndexKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Flat => IndexKind::Flat,
            Backend::Hnsw => IndexKind::Hnsw,
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    backend: Backend,
    dimension: usize,
    chunks: usize,
    cycles: usize,
    ingest_ms: u128,
    ingest_per_sec: f64,
    search: LatencySummary,
    save_ms: u128,
    unload_ms: u128,
    reload_ms: u128,
    snapshot_bytes: u64,
}

#[derive(Debug, Serialize)]
struct LatencySummary {
    queries: usize,
    top_k: usize,
    p50_us: u128,
    p95_us: u128,
    max_us: u128,
}

impl LatencySummary {
    fn from_samples(mut samples: Vec<Duration>, top_k: usize) -> Self {
        samples.sort();
        let pick = |q: f64| -> u128 {
            if samples.is_empty() {
                return 0;
            }
            let idx = ((samples.len() - 1) as f64 * q).round() as usize;
            samples[idx].as_micros()
        };
        Self {
            queries: samples.len(),
            top_k,
            p50_us: pick(0.50),
            p95_us: pick(0.95),
            max_us: samples.last().map(|d| d.as_micros()).unwrap_or(0),
        }
    }
}

fn sentence(rng: &mut StdRng, words: usize) -> String {
    (0..words)
        .map(|_| VOCABULARY[rng.random_range(0..VOCABULARY.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn synthetic_corpus(rng: &mut StdRng, count: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|n| {
            let metadata = if rng.random_bool(0.3) {
                ChunkMetadata::new(SourceType::Website)
                    .with_url(format!("https://example.org/topics/{}", n % 97))
            } else {
                ChunkMetadata::new(SourceType::Pdf)
                    .with_file_path(format!("/library/doc-{}.pdf", n % 131))
                    .with_page_number(rng.random_range(1..400))
            };
            let words = rng.random_range(12..40);
            WorkItem::new(
                format!("bench-{}", n),
                sentence(rng, words),
                metadata.with_document_id(format!("doc-{}", n % 131)),
            )
        })
        .collect()
}

fn dir_size(path: &std::path::Path) -> u64 {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let temp = tempfile::TempDir::new()?;
    let mut settings = test_settings(temp.path());
    settings.index.kind = args.kind.into();
    settings.index.dimension = args.dimension;
    settings.scheduler.max_batch_size = 500;
    settings.scheduler.save_every = usize::MAX;
    settings.monitor.max_batch = 500;

    let source = Arc::new(InMemoryWorkSource::new(synthetic_corpus(&mut rng, args.chunks)));
    let ctx = AppContext::builder(settings)
        .source(source)
        .sampler(Box::new(QuietSampler))
        .build()
        .await?;

    let token = CancellationToken::new();
    let started = Instant::now();
    let mut cycles = 0;
    while ctx.scheduler().run_cycle(&token).await.outcome == CycleOutcome::Worked {
        cycles += 1;
    }
    let ingest = started.elapsed();

    let kb = ctx.knowledge_base();
    let mut samples = Vec::with_capacity(args.queries);
    for _ in 0..args.queries {
        let words = rng.random_range(1..5);
        let query = sentence(&mut rng, words);
        let started = Instant::now();
        kb.search(&query, args.top_k).await?;
        samples.push(started.elapsed());
    }

    let started = Instant::now();
    kb.save()?;
    let save = started.elapsed();

    let started = Instant::now();
    kb.unload()?;
    let unload = started.elapsed();

    let started = Instant::now();
    kb.reload()?;
    let reload = started.elapsed();

    let chunks = kb.stats()?.total;
    let report = Report {
        backend: args.kind,
        dimension: args.dimension,
        chunks,
        cycles,
        ingest_ms: ingest.as_millis(),
        ingest_per_sec: chunks as f64 / ingest.as_secs_f64().max(f64::EPSILON),
        search: LatencySummary::from_samples(samples, args.top_k),
        save_ms: save.as_millis(),
        unload_ms: unload.as_millis(),
        reload_ms: reload.as_millis(),
        snapshot_bytes: dir_size(&ctx.settings().index_dir()),
    };

    let rendered = serde_json::to_string_pretty(&report)?;
    println!("{}", rendered);
    if let Some(out) = args.out {
        std::fs::write(out, rendered)?;
    }
    Ok(())
}
