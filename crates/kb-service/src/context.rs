//! Application context.
//!
//! Everything the process shares is built once here from [`Settings`] and
//! handed out as `Arc`s; nothing lives in globals.

use std::sync::Arc;

use kb_embeddings::EmbeddingModel;
use kb_indexing::CheckpointTracker;
use kb_retrieval::HybridRanker;
use kb_scheduler::{
    IndexUnloader, IngestionScheduler, JsonlWorkSource, Reclaimable, ResourceMonitor,
    ResourceSampler, SchedulerDeps, WorkSource,
};
use kb_vector::{ChunkIndex, SharedIndex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin::AdminService;
use crate::embedder::ConfiguredEmbedder;
use crate::error::ServiceError;
use crate::knowledge_base::KnowledgeBase;
use crate::settings::Settings;

pub struct AppContext {
    settings: Settings,
    index: SharedIndex,
    knowledge_base: Arc<KnowledgeBase>,
    scheduler: Arc<IngestionScheduler>,
    monitor: Arc<ResourceMonitor>,
    checkpoint: Arc<CheckpointTracker>,
}

impl AppContext {
    /// Build with the providers named in `settings`.
    pub async fn new(settings: Settings) -> Result<Self, ServiceError> {
        Self::builder(settings).build().await
    }

    pub fn builder(settings: Settings) -> AppContextBuilder {
        AppContextBuilder {
            settings,
            embedder: None,
            source: None,
            sampler: None,
            in_memory: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge_base
    }

    pub fn scheduler(&self) -> &Arc<IngestionScheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointTracker> {
        &self.checkpoint
    }

    pub fn admin(&self) -> AdminService {
        AdminService::new(self.knowledge_base.clone(), self.scheduler.clone())
    }

    /// Run the resource sampler and the ingestion loop until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), ServiceError> {
        let sampler = tokio::spawn(self.monitor.clone().run_sampler(token.clone()));
        let result = self.scheduler.clone().run(token.clone()).await;

        token.cancel();
        if let Err(e) = sampler.await {
            warn!(error = %e, "Resource sampler task failed");
        }
        result?;
        Ok(())
    }
}

/// Overrides for the collaborators [`AppContext::new`] would build itself.
pub struct AppContextBuilder {
    settings: Settings,
    embedder: Option<Arc<dyn EmbeddingModel>>,
    source: Option<Arc<dyn WorkSource>>,
    sampler: Option<Box<dyn ResourceSampler>>,
    in_memory: bool,
}

impl AppContextBuilder {
    /// Use this provider instead of the configured one (no cache is added).
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingModel>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use this work source instead of the JSON-lines spool.
    pub fn source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sampler(mut self, sampler: Box<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Keep the index and progress in memory only.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub async fn build(self) -> Result<AppContext, ServiceError> {
        let settings = self.settings;
        settings.validate()?;

        let index_config = if self.in_memory {
            let mut config = settings.index.clone();
            config.data_dir = None;
            config
        } else {
            std::fs::create_dir_all(settings.index_dir())?;
            settings.index_config()
        };
        let index = ChunkIndex::open(index_config)?.into_shared();

        let mut reclaimers: Vec<Arc<dyn Reclaimable>> = Vec::new();
        let embedder: Arc<dyn EmbeddingModel> = match self.embedder {
            Some(embedder) => embedder,
            None => {
                let cached = Arc::new(
                    ConfiguredEmbedder::from_settings(&settings.embedding, settings.index.dimension)?
                        .cached(&settings.embedding),
                );
                reclaimers.push(cached.clone());
                cached
            }
        };
        if embedder.dimension() != settings.index.dimension {
            return Err(ServiceError::Config(format!(
                "embedder produces {} dimensions, index expects {}",
                embedder.dimension(),
                settings.index.dimension
            )));
        }
        reclaimers.push(Arc::new(IndexUnloader::new(index.clone())));

        let checkpoint = Arc::new(CheckpointTracker::new(index.clone(), &settings.checkpoint));
        let monitor = Arc::new(match self.sampler {
            Some(sampler) => ResourceMonitor::new(settings.monitor.clone(), sampler),
            None => ResourceMonitor::with_sysinfo(settings.monitor.clone()),
        });

        let knowledge_base = Arc::new(KnowledgeBase::new(
            index.clone(),
            embedder.clone(),
            HybridRanker::new(settings.ranking.clone()),
            checkpoint.clone(),
        ));
        let recovered = knowledge_base.recover_index().await?;
        if recovered > 0 {
            info!(recovered, "Recovered chunks from a damaged index snapshot");
        }

        let source: Arc<dyn WorkSource> = match self.source {
            Some(source) => source,
            None => Arc::new(JsonlWorkSource::new(settings.spool_path())),
        };
        let scheduler = Arc::new(IngestionScheduler::new(
            settings.scheduler.clone(),
            SchedulerDeps {
                index: index.clone(),
                embedder,
                source,
                checkpoint: checkpoint.clone(),
                monitor: monitor.clone(),
                reclaimers,
                progress_path: (!self.in_memory).then(|| settings.progress_path()),
            },
        )?);

        info!(
            data_dir = %settings.data_dir,
            dimension = settings.index.dimension,
            kind = settings.index.kind.as_str(),
            in_memory = self.in_memory,
            "Application context ready"
        );

        Ok(AppContext {
            settings,
            index,
            knowledge_base,
            scheduler,
            monitor,
            checkpoint,
        })
    }
}
