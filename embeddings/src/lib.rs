//! # Embeddings
//!
//! This crate provides embedding generation and similarity search for
//! context retrieval.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors through the
//!   [`EmbeddingProvider`] capability
//! - **Offline Fallback**: A deterministic hash-based provider that needs no
//!   network access
//! - **Similarity Search**: Rank stored vectors by cosine similarity
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► Embedding ──► VectorIndex<T>             │
//! │       │                                   │                     │
//! │       ▼                                   ▼                     │
//! │  OpenAI / Hash                    cosine similarity             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod fallback;
pub mod index;
pub mod provider;
pub mod similarity;

pub use error::{EmbeddingError, Result};
pub use fallback::HashEmbeddingProvider;
pub use index::{IndexedVector, SearchHit, VectorIndex};
pub use provider::{
    EmbeddingProvider, OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL, OpenAIProvider,
    openai_model_dimension,
};
pub use similarity::{cosine_similarity, normalize};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
