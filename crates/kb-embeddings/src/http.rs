//! Embedding provider backed by an OpenAI-compatible `/embeddings` endpoint.
//!
//! Works against OpenAI, Ollama (`/v1`), vLLM and similar servers. Failures
//! that look transient are retried with exponential backoff up to a fixed
//! attempt count; everything else is returned immediately.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::EmbeddingError;
use crate::model::{Embedding, EmbeddingModel, ModelInfo};

/// Configuration for the HTTP embedding provider.
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// API base URL (e.g., "https://api.openai.com/v1")
    pub base_url: String,

    /// Model to request (e.g., "text-embedding-3-small")
    pub model: String,

    /// Expected embedding dimension; responses of another size are rejected
    pub dimension: usize,

    /// Bearer token, if the endpoint needs one
    pub api_key: Option<SecretString>,

    /// Per-request timeout
    pub timeout: Duration,

    /// Maximum attempts per text (first try included)
    pub max_retries: u32,

    /// First backoff delay between attempts
    pub initial_backoff: Duration,
}

impl HttpEmbedderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            dimension,
            api_key: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.initial_backoff = initial_backoff;
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// HTTP embedding provider.
pub struct HttpEmbedder {
    client: Client,
    config: HttpEmbedderConfig,
    info: ModelInfo,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::Config(e.to_string()))?;
        let info = ModelInfo::new(config.model.clone(), config.dimension);

        Ok(Self {
            client,
            config,
            info,
        })
    }

    /// Call the API with retry logic.
    async fn call_api(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            current_interval: self.config.initial_backoff,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        };

        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(attempt = attempts, "Calling embedding API");

            match self.make_request(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempts >= self.config.max_retries {
                        error!(error = %e, attempts, "Max retries exceeded");
                        return Err(e);
                    }

                    match backoff.next_backoff() {
                        Some(duration) => {
                            warn!(
                                error = %e,
                                retry_in_ms = duration.as_millis(),
                                "Embedding call failed, retrying"
                            );
                            tokio::time::sleep(duration).await;
                        }
                        None => {
                            error!(error = %e, "Backoff exhausted");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Make a single API request.
    async fn make_request(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: vec![text],
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Timeout(self.config.timeout.as_millis() as u64)
            } else {
                EmbeddingError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        let values = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty data array".to_string()))?;

        if values.len() != self.config.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.dimension,
                actual: values.len(),
            });
        }

        Ok(Embedding::new(values))
    }
}

fn classify_status(status: StatusCode, body: String) -> EmbeddingError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EmbeddingError::Unavailable(format!("{}: {}", status, body))
    } else {
        EmbeddingError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbedder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        self.call_api(text).await
    }
}
