//! Configuration for the retrieval engine.
//!
//! [`RetrievalConfig`] is an immutable snapshot; the engine swaps whole
//! snapshots. Partial changes arrive as a [`ConfigUpdate`], are merged into a
//! candidate with [`RetrievalConfig::apply`], and the candidate is validated
//! before anything is replaced.

use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ctxrag_embeddings::{
    EmbeddingProvider, HashEmbeddingProvider, OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL,
    OpenAIProvider, openai_model_dimension,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// Accepted chunk sizes, in characters.
pub const CHUNK_SIZE_RANGE: RangeInclusive<i64> = 100..=4000;

/// Accepted chunk overlaps, in characters.
pub const CHUNK_OVERLAP_RANGE: RangeInclusive<i64> = 0..=1000;

/// Accepted number of documents indexed per call.
pub const MAX_SOURCE_DOCUMENTS_RANGE: RangeInclusive<i64> = 1..=50;

/// Environment variable holding the embedding API key.
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// Environment variable overriding the embedding model.
pub const MODEL_ENV_VAR: &str = "CTXRAG_EMBEDDING_MODEL";

/// Environment variable overriding the embedding API base URL.
pub const BASE_URL_ENV_VAR: &str = "CTXRAG_EMBEDDING_BASE_URL";

/// Configuration for the retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Whether retrieval runs at all.
    pub enabled: bool,

    /// Maximum chunk length in characters.
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks.
    pub chunk_overlap: usize,

    /// Cap on documents indexed per call.
    pub max_source_documents: usize,

    /// Minimum cosine similarity for a chunk to count as relevant.
    pub similarity_threshold: f32,

    /// Embedding provider configuration.
    pub embedding: EmbeddingSettings,
}

impl RetrievalConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self {
            enabled: true,
            chunk_size: 1000,
            chunk_overlap: 200,
            max_source_documents: 10,
            similarity_threshold: 0.5,
            embedding: EmbeddingSettings::default(),
        }
    }

    /// A configuration with retrieval switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Set the chunk size and overlap.
    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Set the similarity threshold.
    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Set the per-call document cap.
    pub fn with_max_source_documents(mut self, max: usize) -> Self {
        self.max_source_documents = max;
        self
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, settings: EmbeddingSettings) -> Self {
        self.embedding = settings;
        self
    }

    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by the `*_ENV_VAR` names.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV_VAR).filter(|v| !v.trim().is_empty()) {
            self.embedding.api_key = Some(key);
        }
        if let Some(model) = lookup(MODEL_ENV_VAR).filter(|v| !v.trim().is_empty()) {
            self.embedding.model = model;
        }
        if let Some(url) = lookup(BASE_URL_ENV_VAR).filter(|v| !v.trim().is_empty()) {
            self.embedding.base_url = url;
        }
        self
    }

    /// Check every invariant of this snapshot.
    pub fn validate(&self) -> Result<()> {
        check_range("chunk_size", to_i64(self.chunk_size), &CHUNK_SIZE_RANGE)?;
        check_range(
            "chunk_overlap",
            to_i64(self.chunk_overlap),
            &CHUNK_OVERLAP_RANGE,
        )?;
        if self.chunk_overlap >= self.chunk_size {
            return Err(RetrievalError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        check_range(
            "max_source_documents",
            to_i64(self.max_source_documents),
            &MAX_SOURCE_DOCUMENTS_RANGE,
        )?;
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RetrievalError::Config(format!(
                "similarity_threshold must be between 0.0 and 1.0, got {}",
                self.similarity_threshold
            )));
        }
        self.embedding.validate()
    }

    /// Merge `update` into a copy of this configuration and validate it.
    ///
    /// `self` is never modified; an invalid update yields an error and no
    /// candidate.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<Self> {
        let mut candidate = self.clone();

        if let Some(enabled) = update.enabled {
            candidate.enabled = enabled;
        }
        if let Some(size) = update.chunk_size {
            candidate.chunk_size = checked_usize("chunk_size", size, &CHUNK_SIZE_RANGE)?;
        }
        if let Some(overlap) = update.chunk_overlap {
            candidate.chunk_overlap =
                checked_usize("chunk_overlap", overlap, &CHUNK_OVERLAP_RANGE)?;
        }
        if let Some(max) = update.max_source_documents {
            candidate.max_source_documents =
                checked_usize("max_source_documents", max, &MAX_SOURCE_DOCUMENTS_RANGE)?;
        }
        if let Some(threshold) = update.similarity_threshold {
            candidate.similarity_threshold = threshold;
        }
        if let Some(provider) = update.provider {
            candidate.embedding.provider = provider;
        }
        if let Some(key) = &update.api_key {
            // An empty key clears the stored credentials.
            candidate.embedding.api_key = Some(key.clone()).filter(|k| !k.trim().is_empty());
        }
        if let Some(model) = &update.model {
            candidate.embedding.model = model.clone();
        }
        if let Some(url) = &update.base_url {
            candidate.embedding.base_url = url.clone();
        }
        if let Some(dimensions) = update.dimensions {
            candidate.embedding.dimensions = Some(dimensions);
        }
        if let Some(timeout) = update.request_timeout_secs {
            candidate.embedding.request_timeout_secs = timeout;
        }

        candidate.validate()?;
        Ok(candidate)
    }

    /// Classify what differs between this snapshot and `next`.
    pub(crate) fn diff(&self, next: &RetrievalConfig) -> ConfigChange {
        ConfigChange {
            enabled: self.enabled != next.enabled,
            chunking: self.chunk_size != next.chunk_size
                || self.chunk_overlap != next.chunk_overlap,
            provider: self.embedding.identity() != next.embedding.identity(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Which parts of the configuration an update touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ConfigChange {
    pub enabled: bool,
    pub chunking: bool,
    pub provider: bool,
}

/// Which embedding provider to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// The network provider when an API key is configured, otherwise the
    /// hash fallback.
    #[default]
    Auto,
    /// OpenAI-compatible embeddings API. Requires an API key.
    #[serde(rename = "openai")]
    OpenAi,
    /// Deterministic offline hash embeddings.
    Hash,
}

/// Configuration for the embedding provider.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Which provider to use.
    pub provider: EmbeddingProviderKind,

    /// Credentials for the network provider.
    pub api_key: Option<String>,

    /// Model to use for embeddings.
    pub model: String,

    /// Base URL of the embeddings API.
    pub base_url: String,

    /// Output dimension; defaults to the model's native dimension.
    pub dimensions: Option<usize>,

    /// Timeout for each embedding request.
    pub request_timeout_secs: u64,
}

impl EmbeddingSettings {
    /// Settings for the offline hash provider.
    pub fn hash(dimensions: usize) -> Self {
        Self {
            provider: EmbeddingProviderKind::Hash,
            dimensions: Some(dimensions),
            ..Self::default()
        }
    }

    /// Settings for the network provider.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            provider: EmbeddingProviderKind::OpenAi,
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// The provider [`EmbeddingSettings::build_provider`] will construct.
    pub fn resolved_kind(&self) -> EmbeddingProviderKind {
        match self.provider {
            EmbeddingProviderKind::Auto if self.has_credentials() => {
                EmbeddingProviderKind::OpenAi
            }
            EmbeddingProviderKind::Auto => EmbeddingProviderKind::Hash,
            kind => kind,
        }
    }

    /// Vector dimension of the configured provider.
    pub fn dimension(&self) -> usize {
        self.dimensions
            .unwrap_or_else(|| openai_model_dimension(&self.model))
    }

    fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.provider == EmbeddingProviderKind::OpenAi && !self.has_credentials() {
            return Err(RetrievalError::Config(
                "the openai embedding provider requires an api_key".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(RetrievalError::Config(
                "embedding model must not be empty".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(RetrievalError::Config(
                "embedding base_url must not be empty".to_string(),
            ));
        }
        if self.dimensions == Some(0) {
            return Err(RetrievalError::Config(
                "embedding dimensions must be positive".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(RetrievalError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Everything that determines which embedding space vectors live in.
    fn identity(&self) -> (EmbeddingProviderKind, Option<&str>, &str, &str, usize) {
        let kind = self.resolved_kind();
        match kind {
            EmbeddingProviderKind::Hash => (kind, None, "", "", self.dimension()),
            _ => (
                kind,
                self.api_key.as_deref(),
                self.model.as_str(),
                self.base_url.as_str(),
                self.dimension(),
            ),
        }
    }

    /// Construct the provider these settings select.
    pub fn build_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        self.validate()?;
        match self.resolved_kind() {
            EmbeddingProviderKind::OpenAi => {
                let api_key = self
                    .api_key
                    .as_deref()
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| {
                        RetrievalError::Config(
                            "the openai embedding provider requires an api_key".to_string(),
                        )
                    })?;
                let provider = OpenAIProvider::new(api_key)
                    .with_base_url(self.base_url.as_str())
                    .with_model(self.model.as_str())
                    .with_timeout(Duration::from_secs(self.request_timeout_secs));
                let provider = match self.dimensions {
                    Some(dimensions) => provider.with_dimensions(dimensions),
                    None => provider,
                };
                Ok(Arc::new(provider))
            }
            EmbeddingProviderKind::Auto | EmbeddingProviderKind::Hash => {
                Ok(Arc::new(HashEmbeddingProvider::new(self.dimension())))
            }
        }
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Auto,
            api_key: None,
            model: OPENAI_DEFAULT_MODEL.to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
            dimensions: None,
            request_timeout_secs: 30,
        }
    }
}

impl fmt::Debug for EmbeddingSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingSettings")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dimensions", &self.dimensions)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// A partial configuration change.
///
/// Numeric fields are signed so that out-of-range input from a settings
/// surface is reported instead of failing to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub chunk_size: Option<i64>,
    pub chunk_overlap: Option<i64>,
    pub max_source_documents: Option<i64>,
    pub similarity_threshold: Option<f32>,
    pub provider: Option<EmbeddingProviderKind>,
    /// An empty string clears the stored key.
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub dimensions: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

impl ConfigUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn chunk_size(mut self, size: i64) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn chunk_overlap(mut self, overlap: i64) -> Self {
        self.chunk_overlap = Some(overlap);
        self
    }

    pub fn max_source_documents(mut self, max: i64) -> Self {
        self.max_source_documents = Some(max);
        self
    }

    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn provider(mut self, provider: EmbeddingProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn check_range(field: &str, value: i64, range: &RangeInclusive<i64>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(RetrievalError::Config(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

fn checked_usize(field: &str, value: i64, range: &RangeInclusive<i64>) -> Result<usize> {
    check_range(field, value, range)?;
    usize::try_from(value).map_err(|_| {
        RetrievalError::Config(format!("{field} is out of range for this platform: {value}"))
    })
}
