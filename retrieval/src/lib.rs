//! # Retrieval Engine
//!
//! This crate indexes open workspace documents and retrieves the chunks most
//! similar to the current edit context, for use in suggestion prompts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Retrieval Engine                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  documents ──► TextChunker ──► EmbeddingProvider ──► VectorIndex│
//! │                                 (one batch call)         │      │
//! │                                                          │      │
//! │  SuggestionContext ──► query text ──► embed ──► top-k ◄──┘      │
//! │                                                  │              │
//! │                                       threshold filter          │
//! │                                                  ▼              │
//! │                                          EnhancedContext        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ctxrag_retrieval::{OpenDocument, RetrievalConfig, RetrievalEngine, SuggestionContext};
//!
//! let engine = RetrievalEngine::new(RetrievalConfig::default().with_env_overrides())?;
//!
//! engine
//!     .index_documents(&[OpenDocument::new("file:///src/lib.rs", "rust", source)])
//!     .await;
//!
//! let context = SuggestionContext::new().with_selection("fn parse_header(");
//! if let Some(enhanced) = engine.query(&context, None).await {
//!     println!("{}", enhanced.summary);
//! }
//! ```

pub mod chunker;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod summary;

pub use chunker::{Chunk, TextChunker};
pub use config::{ConfigUpdate, EmbeddingProviderKind, EmbeddingSettings, RetrievalConfig};
pub use document::{Diagnostic, OpenDocument, SourceDocument, SuggestionContext};
pub use engine::{EngineStats, EngineStatus, ErrorRecord, IndexReport, RetrievalEngine};
pub use error::{Result, RetrievalError};
pub use summary::{EnhancedContext, RelevantChunk};

// Re-export from dependencies for convenience
pub use ctxrag_embeddings::{EmbeddingError, EmbeddingProvider};
