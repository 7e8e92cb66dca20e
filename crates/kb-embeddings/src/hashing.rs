//! Deterministic feature-hashing embedder.
//!
//! Each lowercase alphanumeric token is hashed (FNV-1a) into one of
//! `dimension` buckets with a hash-derived sign, and the resulting count
//! vector is normalized. Texts sharing vocabulary land close together, which
//! is enough for offline operation and for tests that need stable vectors.

use async_trait::async_trait;

use crate::error::EmbeddingError;
use crate::model::{Embedding, EmbeddingModel, ModelInfo};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Offline embedder with no model files and no network.
pub struct HashingEmbedder {
    info: ModelInfo,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            info: ModelInfo::new("feature-hashing", dimension.max(1)),
        }
    }

    /// Embed synchronously; the async trait method delegates here.
    pub fn embed_sync(&self, text: &str) -> Embedding {
        let dim = self.info.dimension;
        let mut values = vec![0.0f32; dim];
        for token in tokens(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % dim as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            values[bucket] += sign;
        }
        Embedding::new(values)
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[async_trait]
impl EmbeddingModel for HashingEmbedder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        Ok(self.embed_sync(text))
    }
}
