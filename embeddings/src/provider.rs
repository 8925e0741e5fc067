//! Embedding providers.
//!
//! A provider turns text into fixed-length vectors. Every vector produced by
//! one provider instance has the same dimension, reported by
//! [`EmbeddingProvider::dimension`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the model this provider embeds with.
    fn model(&self) -> &str;

    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Check that the provider is usable, e.g. that credentials are accepted.
    async fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Embed several texts at once. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        if embeddings.len() != 1 {
            return Err(EmbeddingError::BatchSizeMismatch {
                expected: 1,
                actual: embeddings.len(),
            });
        }
        Ok(embeddings.swap_remove(0))
    }
}

/// Default base URL for the OpenAI embeddings API.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default OpenAI embedding model.
pub const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";

/// Output dimension of a known OpenAI embedding model.
pub fn openai_model_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        _ => 1536,
    }
}

/// OpenAI embedding provider.
///
/// Also works against any server that speaks the OpenAI `/embeddings` API.
pub struct OpenAIProvider {
    /// API key.
    api_key: String,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model to embed with.
    model: String,

    /// Requested output dimensions, if overriding the model default.
    dimensions: Option<usize>,

    /// Per-request timeout.
    timeout: Option<Duration>,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            client: reqwest::Client::new(),
            model: OPENAI_DEFAULT_MODEL.to_string(),
            dimensions: None,
            timeout: None,
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request a specific output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Set a timeout applied to every request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn request(&self, texts: &[String]) -> Result<OpenAIEmbeddingResponse> {
        let mut body = serde_json::json!({
            "input": texts,
            "model": self.model,
        });

        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimensions
            .unwrap_or_else(|| openai_model_dimension(&self.model))
    }

    async fn validate(&self) -> Result<()> {
        self.embed_one("ping").await?;
        info!(
            "Validated {} embeddings with model {}",
            self.name(),
            self.model
        );
        Ok(())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating batch embeddings for {} texts with model: {}",
            texts.len(),
            self.model
        );

        let mut result = self.request(texts).await?;

        if result.data.len() != texts.len() {
            return Err(EmbeddingError::BatchSizeMismatch {
                expected: texts.len(),
                actual: result.data.len(),
            });
        }

        // The API may answer out of order; `index` refers to the input position.
        result.data.sort_by_key(|item| item.index);

        let expected = self.dimension();
        let mut embeddings = Vec::with_capacity(result.data.len());
        for item in result.data {
            if item.embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: item.embedding.len(),
                });
            }
            embeddings.push(item.embedding);
        }

        if let Some(usage) = result.usage {
            debug!("Embedding request used {} tokens", usage.total_tokens);
        }
        info!("Generated {} batch embeddings", embeddings.len());

        Ok(embeddings)
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}
