//! Embedding provider selected from settings.

use std::time::Duration;

use async_trait::async_trait;
use kb_embeddings::{
    CachedEmbedder, Embedding, EmbeddingError, EmbeddingModel, HashingEmbedder, HttpEmbedder,
    HttpEmbedderConfig, ModelInfo,
};
use tracing::info;

use crate::settings::{EmbeddingProvider, EmbeddingSettings};

/// Provider chosen at startup.
pub enum ConfiguredEmbedder {
    Hashing(HashingEmbedder),
    Http(HttpEmbedder),
}

impl ConfiguredEmbedder {
    pub fn from_settings(
        settings: &EmbeddingSettings,
        dimension: usize,
    ) -> Result<Self, EmbeddingError> {
        match settings.provider {
            EmbeddingProvider::Hashing => {
                info!(dimension, "Using feature-hashing embedder");
                Ok(Self::Hashing(HashingEmbedder::new(dimension)))
            }
            EmbeddingProvider::Http => {
                let mut config =
                    HttpEmbedderConfig::new(&settings.base_url, &settings.model, dimension)
                        .with_timeout(Duration::from_secs(settings.timeout_secs.max(1)))
                        .with_retries(settings.max_retries, Duration::from_millis(500));
                if let Some(key) = &settings.api_key {
                    config = config.with_api_key(key.as_str());
                }
                info!(
                    base_url = %settings.base_url,
                    model = %settings.model,
                    dimension,
                    "Using HTTP embedder"
                );
                Ok(Self::Http(HttpEmbedder::new(config)?))
            }
        }
    }

    /// Wrap in the LRU cache sized by settings.
    pub fn cached(self, settings: &EmbeddingSettings) -> CachedEmbedder<Self> {
        CachedEmbedder::new(self, settings.cache_size)
    }
}

#[async_trait]
impl EmbeddingModel for ConfiguredEmbedder {
    fn info(&self) -> &ModelInfo {
        match self {
            Self::Hashing(e) => e.info(),
            Self::Http(e) => e.info(),
        }
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        match self {
            Self::Hashing(e) => e.embed(text).await,
            Self::Http(e) => e.embed(text).await,
        }
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        match self {
            Self::Hashing(e) => e.embed_batch(texts).await,
            Self::Http(e) => e.embed_batch(texts).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashing_provider_from_settings() {
        let embedder = ConfiguredEmbedder::from_settings(&EmbeddingSettings::default(), 64)
            .unwrap()
            .cached(&EmbeddingSettings::default());
        assert_eq!(embedder.dimension(), 64);

        let a = embedder.embed("systemic lupus erythematosus").await.unwrap();
        let b = embedder.embed("systemic lupus erythematosus").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(embedder.hit_stats(), (1, 1));
    }

    #[test]
    fn test_http_provider_from_settings() {
        let settings = EmbeddingSettings {
            provider: EmbeddingProvider::Http,
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let embedder = ConfiguredEmbedder::from_settings(&settings, 384).unwrap();
        assert!(matches!(embedder, ConfiguredEmbedder::Http(_)));
        assert_eq!(embedder.info().name, "all-minilm");
    }
}
