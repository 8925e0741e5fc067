//! Error types for the retrieval engine.

use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval engine.
///
/// Provider failures during indexing and querying are absorbed by the
/// engine; callers only see configuration problems.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Invalid or missing settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Chunk parameters that cannot produce a bounded chunk sequence.
    #[error("invalid chunking parameters: {0}")]
    Chunker(String),

    /// Embedding error.
    #[error("embedding error: {0}")]
    Embedding(#[from] ctxrag_embeddings::EmbeddingError),

    /// Malformed configuration file.
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
