//! Embedding model trait and types.
//!
//! Defines the interface for generating vector embeddings from text.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// Vector embedding - a float array, normalized by default.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Create a new embedding from a vector.
    /// Normalizes the vector to unit length.
    pub fn new(values: Vec<f32>) -> Self {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let normalized = if norm > 0.0 {
            values.iter().map(|x| x / norm).collect()
        } else {
            values
        };
        Self { values: normalized }
    }

    /// Create embedding without normalization (pre-normalized or raw vectors)
    pub fn from_normalized(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Squared Euclidean distance. Lower = more similar.
    pub fn squared_l2(&self, other: &Embedding) -> f32 {
        squared_l2(&self.values, &other.values)
    }

    /// Cosine similarity in [-1, 1], assuming both sides are normalized.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// Squared Euclidean distance between two equally sized slices.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Model name (e.g., "text-embedding-3-small")
    pub name: String,
    /// Embedding dimension
    pub dimension: usize,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations must be thread-safe (Send + Sync); the scheduler and the
/// query path share one provider.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn info(&self) -> &ModelInfo;

    fn dimension(&self) -> usize {
        self.info().dimension
    }

    /// Generate embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Generate embeddings for multiple texts.
    /// Default implementation calls embed() for each text.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_normalization() {
        let emb = Embedding::new(vec![3.0, 4.0]);
        assert!((emb.values[0] - 0.6).abs() < 0.001);
        assert!((emb.values[1] - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_zero_vector_left_alone() {
        let emb = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(emb.values, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_squared_l2() {
        let a = Embedding::from_normalized(vec![1.0, 2.0, 3.0]);
        let b = Embedding::from_normalized(vec![1.0, 0.0, 0.0]);
        assert!((a.squared_l2(&b) - 13.0).abs() < 1e-6);
        assert_eq!(a.squared_l2(&a), 0.0);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let emb1 = Embedding::new(vec![1.0, 0.0]);
        let emb2 = Embedding::new(vec![0.0, 1.0]);
        assert!(emb1.cosine_similarity(&emb2).abs() < 0.001);
    }
}
