//! End-to-end tests for the retrieval engine.
//!
//! The network provider is exercised against a local mock server that
//! answers with hash embeddings, so results are deterministic.

use std::time::Duration;

use ctxrag_embeddings::HashEmbeddingProvider;
use ctxrag_retrieval::{
    ConfigUpdate, EmbeddingProviderKind, EmbeddingSettings, EngineStatus, OpenDocument,
    RetrievalConfig, RetrievalEngine, SuggestionContext,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const VALIDATE_INPUT: &str = "function validateInput(input) { return input.length > 0; }";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fallback_config(threshold: f32) -> RetrievalConfig {
    RetrievalConfig::new()
        .with_chunking(1000, 200)
        .with_similarity_threshold(threshold)
        .with_embedding(EmbeddingSettings::hash(384))
}

fn source(path: &str, language: &str, text: &str) -> OpenDocument {
    OpenDocument::new(format!("file://{path}"), language, text)
}

/// Answers `/embeddings` requests with hash embeddings of each input.
struct HashEmbeddings {
    dimension: usize,
}

impl Respond for HashEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let provider = HashEmbeddingProvider::new(self.dimension);
        let data: Vec<serde_json::Value> = body["input"]
            .as_array()
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(index, text)| {
                json!({
                    "embedding": provider.embed_text(text.as_str().unwrap_or_default()),
                    "index": index,
                })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({
            "data": data,
            "model": "text-embedding-3-small",
            "usage": {"prompt_tokens": 1, "total_tokens": 1}
        }))
    }
}

fn openai_config(server: &MockServer) -> RetrievalConfig {
    RetrievalConfig::new()
        .with_similarity_threshold(0.0)
        .with_embedding(
            EmbeddingSettings::openai("sk-test")
                .with_base_url(server.uri())
                .with_dimensions(64),
        )
}

#[tokio::test]
async fn test_disabled_engine_does_nothing() {
    init_tracing();
    let engine = RetrievalEngine::new(RetrievalConfig::disabled()).unwrap();

    assert!(!engine.is_available());
    assert_eq!(engine.status(), EngineStatus::Disabled);

    let report = engine
        .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
        .await;
    assert_eq!(report.documents_indexed, 0);
    assert_eq!(engine.stats().indexed_chunks, 0);

    let context = SuggestionContext::new().with_selection(VALIDATE_INPUT);
    assert_eq!(engine.query(&context, None).await, None);
}

#[tokio::test]
async fn test_fallback_round_trip_finds_the_indexed_chunk() {
    init_tracing();
    let engine = RetrievalEngine::new(fallback_config(0.0)).unwrap();

    let report = engine
        .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
        .await;
    assert_eq!(report.chunks_indexed, 1);

    let context = SuggestionContext::new().with_current_document("file:///src/app.js");
    let enhanced = engine.query(&context, Some(VALIDATE_INPUT)).await.unwrap();

    assert_eq!(enhanced.relevant_chunks.len(), 1);
    let chunk = &enhanced.relevant_chunks[0];
    assert_eq!(chunk.content, VALIDATE_INPUT);
    assert!(chunk.similarity >= 0.99, "similarity {}", chunk.similarity);
    assert_eq!(
        enhanced.related_sources,
        vec!["file:///src/validate.js".to_string()]
    );
    assert_eq!(
        enhanced.summary,
        "Current file: app.js. Found 1 relevant code chunk. Related files: validate.js."
    );
}

#[tokio::test]
async fn test_threshold_filters_out_dissimilar_chunks() {
    init_tracing();
    let config = fallback_config(0.99).with_chunking(200, 0);
    let engine = RetrievalEngine::new(config).unwrap();

    engine
        .index_documents(&[
            source("/src/validate.js", "javascript", VALIDATE_INPUT),
            source(
                "/db/schema.sql",
                "sql",
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, email TEXT NOT NULL);",
            ),
        ])
        .await;
    assert_eq!(engine.stats().indexed_chunks, 2);

    let context = SuggestionContext::new()
        .with_selection("render the navigation bar with three menu entries")
        .with_diagnostic("missing semicolon");
    let enhanced = engine.query(&context, None).await.unwrap();

    assert!(enhanced.relevant_chunks.is_empty());
    assert!(enhanced.related_sources.is_empty());
    assert_eq!(
        enhanced.summary,
        "1 diagnostic in scope. Found 0 relevant code chunks."
    );
}

#[tokio::test]
async fn test_results_are_ranked_and_capped() {
    init_tracing();
    let engine = RetrievalEngine::new(fallback_config(0.0)).unwrap();

    let documents: Vec<OpenDocument> = (0..8)
        .map(|i| {
            source(
                &format!("/src/handler_{i}.rs"),
                "rust",
                &format!("fn handler_{i}(request: Request) -> Response {{ route({i}) }}"),
            )
        })
        .collect();
    engine.index_documents(&documents).await;

    let enhanced = engine
        .query(
            &SuggestionContext::new(),
            Some("fn handler_3(request: Request) -> Response { route(3) }"),
        )
        .await
        .unwrap();

    assert_eq!(enhanced.relevant_chunks.len(), 5);
    assert_eq!(enhanced.relevant_chunks[0].source_id, "file:///src/handler_3.rs");
    for pair in enhanced.relevant_chunks.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test]
async fn test_invalid_updates_are_rejected_atomically() {
    init_tracing();
    let engine = RetrievalEngine::new(fallback_config(0.0)).unwrap();

    assert!(
        engine
            .update_config(ConfigUpdate::new().chunk_size(50))
            .is_err()
    );
    assert_eq!(engine.config().chunk_size, 1000);

    assert!(
        engine
            .update_config(ConfigUpdate::new().chunk_overlap(-1))
            .is_err()
    );
    assert_eq!(engine.config().chunk_overlap, 200);

    // A valid field next to an invalid one is not applied either.
    assert!(
        engine
            .update_config(
                ConfigUpdate::new()
                    .similarity_threshold(0.9)
                    .max_source_documents(51)
            )
            .is_err()
    );
    assert_eq!(engine.config().similarity_threshold, 0.0);
}

#[test]
fn test_network_provider_without_credentials_fails_fast() {
    let config = RetrievalConfig::new().with_embedding(EmbeddingSettings {
        provider: EmbeddingProviderKind::OpenAi,
        ..EmbeddingSettings::default()
    });
    assert!(RetrievalEngine::new(config).is_err());
}

#[tokio::test]
async fn test_network_provider_indexes_and_queries() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(HashEmbeddings { dimension: 64 })
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert_eq!(engine.wait_until_settled().await, EngineStatus::Ready);

    let report = engine
        .index_documents(&[
            source("/src/validate.js", "javascript", VALIDATE_INPUT),
            source("/src/empty.js", "javascript", ""),
        ])
        .await;
    assert_eq!(report.documents_indexed, 1);
    assert_eq!(report.documents_skipped, 1);

    let enhanced = engine
        .query(&SuggestionContext::new(), Some(VALIDATE_INPUT))
        .await
        .unwrap();
    assert!(enhanced.relevant_chunks[0].similarity >= 0.99);

    // Validation probe, one indexing batch, one query.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
}

#[tokio::test]
async fn test_rejected_credentials_leave_engine_failed() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert!(engine.is_available());

    assert_eq!(engine.wait_until_settled().await, EngineStatus::Failed);
    assert!(!engine.is_available());
    assert!(!engine.is_ready());

    let error = engine.last_error().unwrap();
    assert_eq!(error.operation, "initialization");
    assert!(error.message.contains("401"));
    assert!(!error.message.contains("sk-test"));

    let report = engine
        .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
        .await;
    assert_eq!(report.documents_indexed, 0);
    assert_eq!(
        engine
            .query(&SuggestionContext::new(), Some(VALIDATE_INPUT))
            .await,
        None
    );
}

#[tokio::test]
async fn test_failed_engine_recovers_after_reinitialize() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(HashEmbeddings { dimension: 64 })
        .with_priority(2)
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert_eq!(engine.wait_until_settled().await, EngineStatus::Failed);

    engine.reinitialize().unwrap();
    assert_eq!(engine.wait_until_settled().await, EngineStatus::Ready);
}

#[tokio::test]
async fn test_provider_errors_during_indexing_are_absorbed() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(HashEmbeddings { dimension: 64 })
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
        .with_priority(2)
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert_eq!(engine.wait_until_settled().await, EngineStatus::Ready);

    let report = engine
        .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
        .await;

    assert!(report.error.is_some());
    assert_eq!(report.chunks_indexed, 0);
    assert_eq!(engine.stats().indexed_chunks, 0);
    // A runtime failure only ends that call.
    assert_eq!(engine.status(), EngineStatus::Ready);
    assert_eq!(engine.last_error().unwrap().operation, "indexing");

    assert_eq!(
        engine
            .query(&SuggestionContext::new(), Some(VALIDATE_INPUT))
            .await,
        None
    );
    assert_eq!(engine.last_error().unwrap().operation, "query");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operations_wait_for_slow_initialization() {
    init_tracing();
    let server = MockServer::start().await;
    // Delay only the validation probe.
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(DelayedHashEmbeddings {
            dimension: 64,
            delay: Duration::from_millis(300),
        })
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(HashEmbeddings { dimension: 64 })
        .with_priority(2)
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert_eq!(engine.status(), EngineStatus::Initializing);
    assert!(engine.is_available());
    assert!(!engine.is_ready());

    // Issued before validation finishes; must wait rather than no-op.
    let report = engine
        .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
        .await;

    assert!(engine.is_ready());
    assert_eq!(report.chunks_indexed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_indexing_lands_in_cleared_index() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(HashEmbeddings { dimension: 64 })
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(DelayedHashEmbeddings {
            dimension: 64,
            delay: Duration::from_millis(300),
        })
        .with_priority(2)
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert_eq!(engine.wait_until_settled().await, EngineStatus::Ready);

    let indexing = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .update_config(ConfigUpdate::new().provider(EmbeddingProviderKind::Hash))
        .unwrap();
    assert_eq!(engine.stats().indexed_chunks, 0);

    let report = indexing.await.unwrap();
    assert_eq!(report.chunks_indexed, 1);
    assert_eq!(engine.stats().indexed_chunks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_batch_of_old_dimension_is_rejected() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(HashEmbeddings { dimension: 64 })
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(DelayedHashEmbeddings {
            dimension: 64,
            delay: Duration::from_millis(300),
        })
        .with_priority(2)
        .mount(&server)
        .await;

    let engine = RetrievalEngine::new(openai_config(&server)).unwrap();
    assert_eq!(engine.wait_until_settled().await, EngineStatus::Ready);

    let indexing = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .update_config(
            ConfigUpdate::new()
                .provider(EmbeddingProviderKind::Hash)
                .dimensions(128),
        )
        .unwrap();

    let stale = indexing.await.unwrap();
    assert_eq!(stale.chunks_indexed, 0);
    assert!(stale.error.unwrap().contains("dimension mismatch"));

    let stats = engine.stats();
    assert_eq!(stats.indexed_chunks, 0);
    assert_eq!(stats.dimension, Some(128));

    // The new provider keeps working.
    let report = engine
        .index_documents(&[source("/src/validate.js", "javascript", VALIDATE_INPUT)])
        .await;
    assert_eq!(report.error, None);
    assert_eq!(report.chunks_indexed, 1);

    let enhanced = engine
        .query(&SuggestionContext::new(), Some(VALIDATE_INPUT))
        .await
        .unwrap();
    assert_eq!(enhanced.relevant_chunks.len(), 1);
    assert!(enhanced.relevant_chunks[0].similarity >= 0.99);
}

/// [`HashEmbeddings`] with a fixed response delay.
struct DelayedHashEmbeddings {
    dimension: usize,
    delay: Duration,
}

impl Respond for DelayedHashEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        HashEmbeddings {
            dimension: self.dimension,
        }
        .respond(request)
        .set_delay(self.delay)
    }
}
