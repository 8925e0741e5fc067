//! Retrieval engine implementation.
//!
//! The engine moves through four states:
//!
//! ```text
//!              enable / provider change
//!   Disabled ───────────────────────────► Initializing ──► Ready
//!      ▲                                       │
//!      │ disable                               └─────────► Failed
//! ```
//!
//! Initialization is stored as a shared future. Every operation that needs
//! the provider awaits that future instead of assuming the provider exists,
//! so an engine that reports itself available never silently does nothing.
//!
//! Locks are never held across an `.await`. A configuration update that
//! clears the index while an `index_documents` call is embedding does not
//! cancel that call: its chunks land in the freshly cleared index when they
//! match the new provider's dimension, and are rejected otherwise.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tracing::{debug, info, warn};

use ctxrag_embeddings::{EmbeddingError, EmbeddingProvider, VectorIndex};

use crate::chunker::{Chunk, TextChunker};
use crate::config::{ConfigUpdate, RetrievalConfig};
use crate::document::{SourceDocument, SuggestionContext, normalize_query};
use crate::error::Result;
use crate::summary::{EnhancedContext, RelevantChunk};

/// Number of nearest chunks fetched before threshold filtering.
pub const QUERY_TOP_K: usize = 5;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Retrieval is switched off.
    Disabled,
    /// A provider is being constructed and validated.
    Initializing,
    /// The provider is usable.
    Ready,
    /// Provider validation failed; see [`RetrievalEngine::last_error`].
    Failed,
}

/// A provider error the engine absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// What the engine was doing, e.g. `initialization` or `query`.
    pub operation: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome of one [`RetrievalEngine::index_documents`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Documents whose chunks are now in the index.
    pub documents_indexed: usize,

    /// Chunks added to the index.
    pub chunks_indexed: usize,

    /// Chunks from earlier passes replaced by this one.
    pub chunks_replaced: usize,

    /// Documents left out: non-local, unreadable, blank, duplicate, or
    /// beyond `max_source_documents`.
    pub documents_skipped: usize,

    /// Provider error that aborted the pass, if any.
    pub error: Option<String>,
}

/// Statistics about the retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub status: EngineStatus,

    /// Number of chunks in the index.
    pub indexed_chunks: usize,

    /// Number of distinct sources in the index.
    pub indexed_sources: usize,

    /// Dimension of indexed vectors, once known.
    pub dimension: Option<usize>,

    /// When the last indexing pass completed.
    pub last_indexed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
enum InitOutcome {
    Ready(Arc<dyn EmbeddingProvider>),
    Failed(Arc<EmbeddingError>),
}

type InitHandle = Shared<BoxFuture<'static, InitOutcome>>;

struct EngineState {
    config: RetrievalConfig,
    chunker: TextChunker,
    status: EngineStatus,
    /// Bumped whenever the provider is replaced or dropped.
    generation: u64,
    init: Option<InitHandle>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    last_error: Option<ErrorRecord>,
    last_indexed_at: Option<DateTime<Utc>>,
}

/// What an operation needs from the engine once the provider is ready.
struct Session {
    provider: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
    chunker: TextChunker,
    generation: u64,
}

struct Inner {
    state: RwLock<EngineState>,
    index: RwLock<VectorIndex<Chunk>>,
}

/// Indexes open documents and retrieves the chunks most similar to the
/// current edit context.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct RetrievalEngine {
    inner: Arc<Inner>,
}

impl RetrievalEngine {
    /// Create an engine.
    ///
    /// Configuration problems, including a network provider without
    /// credentials, are reported here. Provider validation runs in the
    /// background (or on first use outside a tokio runtime).
    pub fn new(config: RetrievalConfig) -> Result<Self> {
        config.validate()?;
        let chunker = TextChunker::new(config.chunk_size, config.chunk_overlap)?;
        let provider = if config.enabled {
            Some(config.embedding.build_provider()?)
        } else {
            None
        };

        let engine = Self {
            inner: Arc::new(Inner {
                state: RwLock::new(EngineState {
                    config,
                    chunker,
                    status: EngineStatus::Disabled,
                    generation: 0,
                    init: None,
                    provider: None,
                    last_error: None,
                    last_indexed_at: None,
                }),
                index: RwLock::new(VectorIndex::new()),
            }),
        };

        match provider {
            Some(provider) => {
                let mut state = engine.inner.write_state();
                engine.inner.begin_initialization(&mut state, provider);
            }
            None => info!("Retrieval engine created disabled"),
        }

        Ok(engine)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> RetrievalConfig {
        self.inner.read_state().config.clone()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> EngineStatus {
        self.inner.read_state().status
    }

    /// Whether the engine can serve requests, possibly after waiting for
    /// initialization to finish.
    pub fn is_available(&self) -> bool {
        matches!(
            self.status(),
            EngineStatus::Initializing | EngineStatus::Ready
        )
    }

    /// Whether the provider has been validated and is in use.
    pub fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    /// The most recent provider error the engine absorbed.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.inner.read_state().last_error.clone()
    }

    /// Await any in-flight initialization and return the resulting state.
    pub async fn wait_until_settled(&self) -> EngineStatus {
        let _ = self.session().await;
        self.status()
    }

    /// Get engine statistics.
    pub fn stats(&self) -> EngineStats {
        let (status, last_indexed_at) = {
            let state = self.inner.read_state();
            (state.status, state.last_indexed_at)
        };
        let index = self.inner.read_index();
        let sources: HashSet<&str> = index
            .iter()
            .map(|entry| entry.item.source_id.as_str())
            .collect();

        EngineStats {
            status,
            indexed_chunks: index.len(),
            indexed_sources: sources.len(),
            dimension: index.dimension(),
            last_indexed_at,
        }
    }

    /// Validate and apply a partial configuration change.
    ///
    /// On error nothing changes. Changing chunk parameters only affects
    /// later indexing passes. Enabling the engine or changing the provider's
    /// identity (kind, credentials, model, endpoint, dimension) clears the
    /// index and starts a new initialization. Disabling drops the provider
    /// and clears the index.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        let mut state = self.inner.write_state();

        let candidate = state.config.apply(&update)?;
        let change = state.config.diff(&candidate);
        let chunker = TextChunker::new(candidate.chunk_size, candidate.chunk_overlap)?;
        let provider = if candidate.enabled && (change.enabled || change.provider) {
            Some(candidate.embedding.build_provider()?)
        } else {
            None
        };

        // Everything fallible is done; swap.
        state.config = candidate;
        if change.chunking {
            debug!(
                "Chunking changed to size {} overlap {}",
                chunker.chunk_size(),
                chunker.chunk_overlap()
            );
        }
        state.chunker = chunker;

        if !state.config.enabled {
            if state.status != EngineStatus::Disabled {
                self.inner.disable(&mut state);
            }
        } else if let Some(provider) = provider {
            self.inner.begin_initialization(&mut state, provider);
        }

        Ok(())
    }

    /// Start a fresh initialization with the current configuration.
    ///
    /// This is how a `Failed` engine is retried. The index is cleared.
    /// Does nothing while disabled.
    pub fn reinitialize(&self) -> Result<()> {
        let mut state = self.inner.write_state();
        if !state.config.enabled {
            return Ok(());
        }
        let provider = state.config.embedding.build_provider()?;
        self.inner.begin_initialization(&mut state, provider);
        Ok(())
    }

    /// Chunk, embed, and index `documents`.
    ///
    /// Non-local, unreadable, and blank documents are skipped, as is
    /// anything past `max_source_documents`. All chunks go to the provider
    /// in a single batch. Chunks of a re-indexed source replace that
    /// source's previous chunks; a source re-submitted blank loses them.
    /// Provider errors are recorded and leave the index as it was.
    pub async fn index_documents<D>(&self, documents: &[D]) -> IndexReport
    where
        D: SourceDocument,
    {
        let Some(session) = self.session().await else {
            debug!("Skipping indexing: retrieval engine is not ready");
            return IndexReport::default();
        };

        let mut report = IndexReport::default();
        let mut sources: HashSet<String> = HashSet::new();
        // Sources that are now blank; their earlier chunks are dropped.
        let mut emptied: HashSet<String> = HashSet::new();
        let mut chunks: Vec<Chunk> = Vec::new();

        for document in documents {
            let uri = document.uri();
            if sources.len() >= session.config.max_source_documents
                || sources.contains(uri)
                || emptied.contains(uri)
                || !document.is_local()
            {
                report.documents_skipped += 1;
                continue;
            }

            let text = match document.text() {
                Ok(text) => text,
                Err(err) => {
                    warn!("Skipping unreadable document {uri}: {err:#}");
                    report.documents_skipped += 1;
                    continue;
                }
            };

            let document_chunks =
                session
                    .chunker
                    .chunk_document(uri, document.language_id(), &text);
            if document_chunks.is_empty() {
                emptied.insert(uri.to_string());
                report.documents_skipped += 1;
                continue;
            }

            sources.insert(uri.to_string());
            chunks.extend(document_chunks);
        }

        let vectors = if chunks.is_empty() {
            if emptied.is_empty() {
                debug!("Nothing to index");
                return report;
            }
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
            debug!(
                "Embedding {} chunks from {} documents",
                texts.len(),
                sources.len()
            );

            match session.provider.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(err) => {
                    report.error = Some(err.to_string());
                    self.inner.record_error("indexing", &err);
                    return report;
                }
            }
        };

        if vectors.len() != chunks.len() {
            let err = EmbeddingError::BatchSizeMismatch {
                expected: chunks.len(),
                actual: vectors.len(),
            };
            report.error = Some(err.to_string());
            self.inner.record_error("indexing", &err);
            return report;
        }

        let chunk_count = chunks.len();
        let items: Vec<_> = vectors.into_iter().zip(chunks).collect();
        let replaced = {
            let mut index = self.inner.write_index();
            index.replace(items, |chunk| {
                sources.contains(&chunk.source_id) || emptied.contains(&chunk.source_id)
            })
        };

        match replaced {
            Ok(replaced) => {
                report.documents_indexed = sources.len();
                report.chunks_indexed = chunk_count;
                report.chunks_replaced = replaced;
                self.inner.write_state().last_indexed_at = Some(Utc::now());
                info!(
                    "Indexed {chunk_count} chunks from {} documents ({replaced} replaced)",
                    sources.len()
                );
            }
            Err(err) => {
                report.error = Some(err.to_string());
                self.inner.record_error("indexing", &err);
            }
        }

        report
    }

    /// Retrieve context relevant to `context`.
    ///
    /// Uses `query_text` when given and non-blank, otherwise a query derived
    /// from the context; either is cut to 500 characters. Returns `None`
    /// when disabled, failed, when there is no query, or when the provider
    /// errors. Otherwise returns up to [`QUERY_TOP_K`] chunks at or above
    /// the similarity threshold, which may be none.
    pub async fn query(
        &self,
        context: &SuggestionContext,
        query_text: Option<&str>,
    ) -> Option<EnhancedContext> {
        let Some(query) = query_text
            .and_then(normalize_query)
            .or_else(|| context.query_text())
        else {
            debug!("No query text for retrieval");
            return None;
        };

        let session = self.session().await?;

        let vector = match session.provider.embed_one(&query).await {
            Ok(vector) => vector,
            Err(err) => {
                self.inner.record_error("query", &err);
                return None;
            }
        };

        let ranked = {
            let state = self.inner.read_state();
            if state.generation != session.generation {
                // The provider changed while embedding; the vector belongs
                // to a different embedding space.
                debug!("Discarding query embedded by a replaced provider");
                return None;
            }
            let index = self.inner.read_index();
            index.query(&vector, QUERY_TOP_K).map(|hits| {
                hits.into_iter()
                    .filter(|hit| hit.similarity >= session.config.similarity_threshold)
                    .map(|hit| RelevantChunk {
                        content: hit.item.content.clone(),
                        source_id: hit.item.source_id.clone(),
                        similarity: hit.similarity,
                    })
                    .collect::<Vec<_>>()
            })
        };

        let relevant = match ranked {
            Ok(relevant) => relevant,
            Err(err) => {
                self.inner.record_error("query", &err);
                return None;
            }
        };

        debug!("Query matched {} chunks", relevant.len());
        Some(EnhancedContext::new(
            relevant,
            context.current_document.as_deref(),
            context.diagnostics.len(),
        ))
    }

    /// Wait for initialization and capture what an operation needs.
    ///
    /// Returns `None` when disabled or failed.
    async fn session(&self) -> Option<Session> {
        loop {
            let (generation, init) = {
                let state = self.inner.read_state();
                match state.status {
                    EngineStatus::Disabled | EngineStatus::Failed => return None,
                    EngineStatus::Ready => {
                        return state.provider.clone().map(|provider| Session {
                            provider,
                            config: state.config.clone(),
                            chunker: state.chunker,
                            generation: state.generation,
                        });
                    }
                    EngineStatus::Initializing => match &state.init {
                        Some(init) => (state.generation, init.clone()),
                        None => return None,
                    },
                }
            };

            let outcome = init.await;
            self.inner.finish_initialization(generation, outcome);
        }
    }
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, VectorIndex<Chunk>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, VectorIndex<Chunk>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `Initializing` with `provider`, clearing the index.
    fn begin_initialization(
        self: &Arc<Self>,
        state: &mut EngineState,
        provider: Arc<dyn EmbeddingProvider>,
    ) {
        state.generation += 1;
        state.status = EngineStatus::Initializing;
        state.provider = None;
        let generation = state.generation;
        let dimension = provider.dimension();

        info!(
            "Initializing {} embeddings (model {}, dimension {})",
            provider.name(),
            provider.model(),
            provider.dimension()
        );

        let init: InitHandle = async move {
            match provider.validate().await {
                Ok(()) => InitOutcome::Ready(provider),
                Err(err) => InitOutcome::Failed(Arc::new(err)),
            }
        }
        .boxed()
        .shared();
        state.init = Some(init.clone());

        // Pin the new embedding space so a batch embedded by the previous
        // provider at another dimension is rejected instead of adopted.
        *self.write_index() = VectorIndex::with_dimension(dimension);

        // Drive validation eagerly when a runtime is around; callers await
        // the same handle either way.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak: Weak<Self> = Arc::downgrade(self);
            runtime.spawn(async move {
                let outcome = init.await;
                if let Some(inner) = weak.upgrade() {
                    inner.finish_initialization(generation, outcome);
                }
            });
        }
    }

    /// Record the outcome of initialization `generation`, unless a newer
    /// one has started or this one was already recorded.
    fn finish_initialization(&self, generation: u64, outcome: InitOutcome) {
        let mut state = self.write_state();
        if state.generation != generation || state.status != EngineStatus::Initializing {
            return;
        }

        state.init = None;
        match outcome {
            InitOutcome::Ready(provider) => {
                info!("Retrieval engine ready with {} embeddings", provider.name());
                state.provider = Some(provider);
                state.status = EngineStatus::Ready;
            }
            InitOutcome::Failed(err) => {
                warn!("Embedding provider initialization failed: {err}");
                state.status = EngineStatus::Failed;
                state.last_error = Some(ErrorRecord {
                    operation: "initialization",
                    message: err.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }

    fn disable(&self, state: &mut EngineState) {
        state.generation += 1;
        state.status = EngineStatus::Disabled;
        state.init = None;
        state.provider = None;
        *self.write_index() = VectorIndex::new();
        info!("Retrieval engine disabled");
    }

    fn record_error(&self, operation: &'static str, err: &EmbeddingError) {
        warn!("Retrieval {operation} failed: {err}");
        self.write_state().last_error = Some(ErrorRecord {
            operation,
            message: err.to_string(),
            at: Utc::now(),
        });
    }
}
