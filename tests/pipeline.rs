//! End-to-end pipeline tests: file events through chunking, embedding, and
//! storage, then queries through retrieval, assembly, and streaming.
//!
//! Providers are mocked: embeddings are deterministic keyword-count vectors
//! so similarity behaves predictably, and generation replays scripted
//! fragments.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use sqlx::Row;
use tempfile::TempDir;

use note_rags::config::{
    ChunkingConfig, Config, ContextConfig, DbConfig, EmbeddingConfig, GenerationConfig,
    RetrievalConfig, ServerConfig,
};
use note_rags::context::ContextAssembler;
use note_rags::db;
use note_rags::embedding::{Embedder, EmbeddingProvider};
use note_rags::error::PipelineError;
use note_rags::generate::{FragmentStream, GenerationProvider};
use note_rags::ingest::IngestionCoordinator;
use note_rags::migrate;
use note_rags::models::{
    ChangeType, FileChangeEvent, IngestState, IngestStep, QueryRequest, StreamEvent,
};
use note_rags::query::QueryPipeline;
use note_rags::retrieve::Retriever;
use note_rags::store::VectorStore;

const DIMS: usize = 4;
const KEYWORDS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

/// Deterministic embeddings: one dimension per keyword, valued by how often
/// the keyword occurs. Texts about "alpha" land near queries about "alpha".
struct KeywordEmbeddings;

fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .map(|k| lower.matches(k).count() as f32)
        .collect()
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbeddings {
    fn model_name(&self) -> &str {
        "keyword-mock"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

/// Fails the first `failures` calls with a transient error, then delegates
/// to [`KeywordEmbeddings`]. Optionally flips into a permanently-failing
/// mode via `fail_now`.
struct FlakyEmbeddings {
    calls: AtomicU32,
    failures: u32,
    fail_now: AtomicBool,
}

impl FlakyEmbeddings {
    fn new(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            fail_now: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbeddings {
    fn model_name(&self) -> &str {
        "flaky-mock"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_now.load(Ordering::SeqCst) {
            return Err(PipelineError::TransientProvider("outage".into()));
        }
        if call < self.failures {
            return Err(PipelineError::TransientProvider("rate limited".into()));
        }
        KeywordEmbeddings.embed(texts).await
    }
}

/// Replays a fixed fragment sequence for any prompt.
struct ScriptedGenerator {
    fragments: Vec<String>,
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream_answer(&self, _prompt: &str) -> Result<FragmentStream, PipelineError> {
        let items: Vec<Result<String, PipelineError>> =
            self.fragments.iter().cloned().map(Ok).collect();
        Ok(stream::iter(items).boxed())
    }
}

fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("data/nrag.sqlite"),
            max_connections: 5,
        },
        chunking: ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 10,
        },
        retrieval: RetrievalConfig {
            top_k: 4,
            threshold: None,
        },
        context: ContextConfig::default(),
        embedding: EmbeddingConfig {
            dims: DIMS,
            batch_size: 8,
            max_retries: 3,
            ..Default::default()
        },
        generation: GenerationConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn setup(
    tmp: &TempDir,
    provider: Arc<dyn EmbeddingProvider>,
) -> (VectorStore, Embedder, IngestionCoordinator) {
    setup_with_retries(tmp, provider, 3).await
}

async fn setup_with_retries(
    tmp: &TempDir,
    provider: Arc<dyn EmbeddingProvider>,
    max_retries: u32,
) -> (VectorStore, Embedder, IngestionCoordinator) {
    let mut cfg = test_config(tmp);
    cfg.embedding.max_retries = max_retries;
    let pool = db::connect(&cfg.db).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let embedder = Embedder::new(provider, &cfg.embedding);
    let store = VectorStore::new(pool, cfg.embedding.dims);
    let coordinator =
        IngestionCoordinator::new(store.clone(), embedder.clone(), cfg.chunking.clone());
    (store, embedder, coordinator)
}

fn write_note(tmp: &TempDir, name: &str, content: &str) -> String {
    let path = tmp.path().join(name);
    fs::write(&path, content).unwrap();
    path.display().to_string()
}

fn modified_event(file_path: &str) -> FileChangeEvent {
    FileChangeEvent {
        file_path: file_path.to_string(),
        change_type: ChangeType::Modified,
    }
}

async fn db_chunks(store: &VectorStore, file_path: &str) -> Vec<(i64, String)> {
    let doc = store
        .get_document_by_path(file_path)
        .await
        .unwrap()
        .expect("document should exist");
    let rows = sqlx::query(
        "SELECT chunk_index, content FROM chunks WHERE document_id = ? ORDER BY chunk_index",
    )
    .bind(&doc.id)
    .fetch_all(store.pool())
    .await
    .unwrap();
    rows.iter()
        .map(|r| (r.get("chunk_index"), r.get("content")))
        .collect()
}

// ============ Ingestion ============

#[tokio::test]
async fn test_ingest_writes_contiguous_chunks() {
    let tmp = TempDir::new().unwrap();
    let content = "alpha launch notes. ".repeat(5) + &"beta milestone notes. ".repeat(3);
    let path = write_note(&tmp, "notes.md", &content);
    let (store, _, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    let outcome = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(outcome.state, IngestState::Complete);

    let expected = note_rags::chunk::chunk_text(&content, 40, 10);
    assert!(expected.len() > 1, "content should span multiple chunks");
    assert_eq!(outcome.chunks_written, expected.len());

    let chunks = db_chunks(&store, &path).await;
    let indices: Vec<i64> = chunks.iter().map(|(i, _)| *i).collect();
    let contiguous: Vec<i64> = (0..expected.len() as i64).collect();
    assert_eq!(indices, contiguous);
}

#[tokio::test]
async fn test_stored_chunks_reconstruct_document() {
    let tmp = TempDir::new().unwrap();
    let content = "alpha planning details here. ".repeat(4) + "gamma review at the end.";
    let path = write_note(&tmp, "plan.md", &content);
    let (store, _, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    let outcome = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(outcome.state, IngestState::Complete);

    let chunks = db_chunks(&store, &path).await;
    let mut rebuilt = chunks[0].1.clone();
    for (_, text) in &chunks[1..] {
        rebuilt.push_str(&text[10..]); // skip the 10-char overlap
    }
    assert_eq!(rebuilt, content);
}

#[tokio::test]
async fn test_unchanged_reingest_keeps_chunk_ids() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "stable.md", &"alpha stable content. ".repeat(4));
    let (store, _, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    let first = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(first.state, IngestState::Complete);
    let doc = store.get_document_by_path(&path).await.unwrap().unwrap();
    let ids_before = store.chunk_ids(&doc.id).await.unwrap();

    let second = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(second.state, IngestState::Complete);
    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.detail, "file unchanged");

    let ids_after = store.chunk_ids(&doc.id).await.unwrap();
    assert_eq!(ids_before, ids_after);
}

#[tokio::test]
async fn test_modified_content_replaces_chunk_set() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "evolving.md", &"alpha first draft. ".repeat(4));
    let (store, _, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    coordinator.process_event(&modified_event(&path)).await;
    let doc = store.get_document_by_path(&path).await.unwrap().unwrap();
    let old_ids: Vec<String> = store
        .chunk_ids(&doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    fs::write(Path::new(&path), "beta second draft. ".repeat(6)).unwrap();
    let outcome = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(outcome.state, IngestState::Complete);

    // Same document identity, entirely new chunk set, contiguous ordinals.
    let doc_after = store.get_document_by_path(&path).await.unwrap().unwrap();
    assert_eq!(doc_after.id, doc.id);

    let new_chunks = store.chunk_ids(&doc.id).await.unwrap();
    for (id, _) in &new_chunks {
        assert!(!old_ids.contains(id));
    }
    let indices: Vec<i64> = new_chunks.iter().map(|(_, i)| *i).collect();
    let contiguous: Vec<i64> = (0..new_chunks.len() as i64).collect();
    assert_eq!(indices, contiguous);
}

#[tokio::test]
async fn test_delete_then_search_finds_nothing() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "doomed.md", &"alpha doomed notes. ".repeat(4));
    let (store, _, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    coordinator.process_event(&modified_event(&path)).await;

    let delete = FileChangeEvent {
        file_path: path.clone(),
        change_type: ChangeType::Deleted,
    };
    let outcome = coordinator.process_event(&delete).await;
    assert_eq!(outcome.state, IngestState::Complete);

    let results = store
        .search(&keyword_vector("alpha"), 10, None)
        .await
        .unwrap();
    assert!(results.is_empty());

    // Deleting again is not an error.
    let repeat = coordinator.process_event(&delete).await;
    assert_eq!(repeat.state, IngestState::Complete);
}

#[tokio::test]
async fn test_ingestion_recovers_from_transient_embedding_failures() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "retry.md", &"alpha retry notes. ".repeat(4));
    let flaky = Arc::new(FlakyEmbeddings::new(1));
    let (store, _, coordinator) = setup_with_retries(&tmp, flaky.clone(), 2).await;

    let outcome = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(outcome.state, IngestState::Complete);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

    let results = store
        .search(&keyword_vector("alpha"), 10, None)
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_embedding_outage_leaves_previous_revision_queryable() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "versioned.md", &"alpha version one. ".repeat(4));
    let flaky = Arc::new(FlakyEmbeddings::new(0));
    let (store, _, coordinator) = setup_with_retries(&tmp, flaky.clone(), 0).await;

    let first = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(first.state, IngestState::Complete);

    flaky.fail_now.store(true, Ordering::SeqCst);
    fs::write(Path::new(&path), "beta version two. ".repeat(4)).unwrap();
    let second = coordinator.process_event(&modified_event(&path)).await;
    assert_eq!(second.state, IngestState::Failed);
    assert_eq!(second.failed_at, Some(IngestStep::Embed));

    // The old revision is still the one served.
    let results = store
        .search(&keyword_vector("alpha"), 10, None)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].content.contains("version one"));
}

#[tokio::test]
async fn test_unreadable_file_fails_at_read() {
    let tmp = TempDir::new().unwrap();
    let (_, _, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    let missing = tmp.path().join("never-written.md").display().to_string();
    let outcome = coordinator.process_event(&modified_event(&missing)).await;
    assert_eq!(outcome.state, IngestState::Failed);
    assert_eq!(outcome.failed_at, Some(IngestStep::Read));
}

#[tokio::test]
async fn test_same_path_ingestions_never_interleave() {
    // Blocks inside the embedder until released, so the first ingestion can
    // be held mid-flight while a second event for the same path arrives.
    struct GatedEmbeddings {
        calls: AtomicU32,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl EmbeddingProvider for GatedEmbeddings {
        fn model_name(&self) -> &str {
            "gated-mock"
        }
        fn dims(&self) -> usize {
            DIMS
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| PipelineError::TransientProvider("gate closed".into()))?;
            permit.forget();
            KeywordEmbeddings.embed(texts).await
        }
    }

    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "racy.md", &"alpha concurrent notes. ".repeat(4));
    let gated = Arc::new(GatedEmbeddings {
        calls: AtomicU32::new(0),
        gate: tokio::sync::Semaphore::new(0),
    });
    let (store, _, coordinator) = setup(&tmp, gated.clone()).await;
    let coordinator = Arc::new(coordinator);

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let path = path.clone();
        async move { coordinator.process_event(&modified_event(&path)).await }
    });

    // Wait until the first ingestion is inside the embedder.
    for _ in 0..100 {
        if gated.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(gated.calls.load(Ordering::SeqCst), 1);

    let second = tokio::spawn({
        let coordinator = coordinator.clone();
        let path = path.clone();
        async move { coordinator.process_event(&modified_event(&path)).await }
    });

    // The second event must wait on the per-path lock instead of starting
    // another embedding pass.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(gated.calls.load(Ordering::SeqCst), 1);

    gated.gate.add_permits(1);
    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.state, IngestState::Complete);
    assert_eq!(second.state, IngestState::Complete);

    // One run wrote the chunk set; the serialized second run saw the
    // unchanged content hash and skipped re-embedding entirely.
    assert!(first.chunks_written > 0);
    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.detail, "file unchanged");
    assert_eq!(gated.calls.load(Ordering::SeqCst), 1);

    let chunks = db_chunks(&store, &path).await;
    let indices: Vec<i64> = chunks.iter().map(|(i, _)| *i).collect();
    let contiguous: Vec<i64> = (0..first.chunks_written as i64).collect();
    assert_eq!(indices, contiguous);

    // Once the path quiesces its lock entry is evicted.
    assert_eq!(coordinator.active_locks(), 0);
}

// ============ Query pipeline ============

fn pipeline(store: VectorStore, embedder: Embedder, fragments: &[&str]) -> QueryPipeline {
    pipeline_with(
        store,
        embedder,
        Arc::new(ScriptedGenerator {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
        }),
        None,
    )
}

fn pipeline_with(
    store: VectorStore,
    embedder: Embedder,
    generator: Arc<dyn GenerationProvider>,
    threshold: Option<f32>,
) -> QueryPipeline {
    let retriever = Retriever::new(store, embedder, RetrievalConfig { top_k: 4, threshold });
    let assembler = ContextAssembler::new(
        ContextConfig::default(),
        ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 10,
        },
    );
    QueryPipeline::new(retriever, assembler, generator)
}

fn request(text: &str) -> QueryRequest {
    QueryRequest {
        text: text.to_string(),
        session_id: None,
        history: Vec::new(),
        top_k: None,
        threshold: None,
    }
}

#[tokio::test]
async fn test_query_stream_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let alpha = write_note(&tmp, "alpha.md", &"alpha launch planning. ".repeat(4));
    let beta = write_note(&tmp, "beta.md", &"beta infrastructure work. ".repeat(4));
    let (store, embedder, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;

    coordinator.process_event(&modified_event(&alpha)).await;
    coordinator.process_event(&modified_event(&beta)).await;

    let alpha_doc = store.get_document_by_path(&alpha).await.unwrap().unwrap();
    let pipeline = pipeline(store, embedder, &["The launch ", "is planned."]);

    let events: Vec<StreamEvent> = pipeline
        .stream(&request("when is the alpha launch?"))
        .await
        .unwrap()
        .collect()
        .await;

    // Context first, best match from the alpha document.
    match &events[0] {
        StreamEvent::Context { snippets } => {
            assert!(!snippets.is_empty());
            assert_eq!(snippets[0].document_id, alpha_doc.id);
        }
        other => panic!("expected context first, got {:?}", other),
    }

    let mut concatenated = String::new();
    let mut complete = None;
    for event in &events {
        match event {
            StreamEvent::Answer { text } => concatenated.push_str(text),
            StreamEvent::Complete(payload) => complete = Some(payload.clone()),
            _ => {}
        }
    }
    let complete = complete.expect("stream must end with complete");
    assert_eq!(concatenated, "The launch is planned.");
    assert_eq!(complete.answer, concatenated);
    assert!(matches!(events.last(), Some(StreamEvent::Complete(_))));
}

#[tokio::test]
async fn test_no_match_query_completes_without_error() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "alpha.md", &"alpha only content. ".repeat(4));
    let (store, embedder, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;
    coordinator.process_event(&modified_event(&path)).await;

    let generator = Arc::new(ScriptedGenerator {
        fragments: vec!["I could not find that in the notes.".to_string()],
    });
    let pipeline = pipeline_with(store, embedder, generator, Some(0.9));

    let events: Vec<StreamEvent> = pipeline
        .stream(&request("anything about delta?"))
        .await
        .unwrap()
        .collect()
        .await;

    match &events[0] {
        StreamEvent::Context { snippets } => assert!(snippets.is_empty()),
        other => panic!("expected context first, got {:?}", other),
    }
    assert!(matches!(events.last(), Some(StreamEvent::Complete(_))));
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::Error { .. })));
}

#[tokio::test]
async fn test_non_streaming_answer_matches_stream() {
    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "alpha.md", &"alpha quarterly goals. ".repeat(4));
    let (store, embedder, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;
    coordinator.process_event(&modified_event(&path)).await;

    let pipeline = pipeline(store, embedder, &["Ship ", "in ", "March."]);
    let answer = pipeline.answer(&request("alpha goals?")).await.unwrap();
    assert_eq!(answer.answer, "Ship in March.");
    assert!(answer.context_count > 0);
}

#[tokio::test]
async fn test_empty_question_rejected_before_streaming() {
    let tmp = TempDir::new().unwrap();
    let (store, embedder, _) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;
    let pipeline = pipeline(store, embedder, &["unused"]);

    let err = pipeline.stream(&request("   ")).await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedInput(_)));
}

#[tokio::test]
async fn test_client_disconnect_cancels_generation() {
    struct EndlessGenerator {
        cancelled: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl GenerationProvider for EndlessGenerator {
        fn model_name(&self) -> &str {
            "endless-mock"
        }

        async fn stream_answer(&self, _prompt: &str) -> Result<FragmentStream, PipelineError> {
            let guard = DropFlag(self.cancelled.clone());
            Ok(stream::repeat_with(move || {
                let _held = &guard;
                Ok::<String, PipelineError>("tok ".to_string())
            })
            .boxed())
        }
    }

    let tmp = TempDir::new().unwrap();
    let path = write_note(&tmp, "alpha.md", &"alpha endless notes. ".repeat(4));
    let (store, embedder, coordinator) = setup(&tmp, Arc::new(KeywordEmbeddings)).await;
    coordinator.process_event(&modified_event(&path)).await;

    let cancelled = Arc::new(AtomicBool::new(false));
    let generator = Arc::new(EndlessGenerator {
        cancelled: cancelled.clone(),
    });
    let pipeline = pipeline_with(store, embedder, generator, None);

    let mut events = pipeline.stream(&request("alpha?")).await.unwrap();
    let first = events.next().await;
    assert!(matches!(first, Some(StreamEvent::Context { .. })));
    drop(events);

    for _ in 0..50 {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cancelled.load(Ordering::SeqCst));
}
