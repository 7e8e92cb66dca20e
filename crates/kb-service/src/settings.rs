//! Configuration loading for kb-retrieval.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at `~/.config/kb-retrieval/config.toml`.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use kb_indexing::{CheckpointConfig, PROGRESS_FILE};
use kb_retrieval::RankerConfig;
use kb_scheduler::{MonitorConfig, SchedulerConfig};
use kb_vector::ChunkIndexConfig;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

const APP_NAME: &str = "kb-retrieval";

/// Which embedding provider to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Offline feature hashing; no endpoint needed
    #[default]
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
}

/// Embedding provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// API base URL (e.g., "http://localhost:11434/v1")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// API key (prefer the KB_EMBEDDING__API_KEY env var over the config file)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Entries kept in the LRU embedding cache
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_embedding_retries() -> u32 {
    3
}

fn default_cache_size() -> usize {
    1024
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            base_url: default_base_url(),
            model: default_embedding_model(),
            api_key: None,
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            cache_size: default_cache_size(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the index snapshot, progress file and spool
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON-lines work spool; defaults to `<data_dir>/spool.jsonl`
    #[serde(default)]
    pub spool_path: Option<String>,

    #[serde(default)]
    pub index: ChunkIndexConfig,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub ranking: RankerConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_data_dir() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./kb-data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            spool_path: None,
            index: ChunkIndexConfig::default(),
            embedding: EmbeddingSettings::default(),
            ranking: RankerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/kb-retrieval/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (KB_*, `__` between nested keys)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, ServiceError> {
        let config_dir = ProjectDirs::from("", "", APP_NAME)
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("data_dir", default_data_dir())?
            .set_default("log_level", default_log_level())?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // KB_DATA_DIR, KB_SCHEDULER__MAX_BATCH_SIZE, KB_EMBEDDING__API_KEY, ...
        builder = builder.add_source(
            Environment::with_prefix("KB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.index.dimension == 0 {
            return Err(ServiceError::Config("index.dimension must be > 0".to_string()));
        }
        self.scheduler.validate()?;
        Ok(())
    }

    /// `data_dir` with a leading `~/` expanded.
    pub fn expanded_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Some(home) = directories::BaseDirs::new() {
                return home.home_dir().join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.expanded_data_dir().join("index")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.expanded_data_dir().join(PROGRESS_FILE)
    }

    pub fn spool_path(&self) -> PathBuf {
        self.spool_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.expanded_data_dir().join("spool.jsonl"))
    }

    /// Index configuration pointed at [`Self::index_dir`].
    pub fn index_config(&self) -> ChunkIndexConfig {
        self.index.clone().with_data_dir(self.index_dir())
    }
}
