//! Ingestion pipeline orchestration.
//!
//! Drives Chunker → Embedder → VectorStore for a file change event to a
//! terminal outcome; a failed outcome names the step that stopped it
//! (read, embed, store). Failure never leaves a partial chunk set visible:
//! chunking and embedding finish before the single replacing transaction,
//! so the previous revision stays queryable until the new one lands.
//!
//! Re-ingesting unchanged content (same SHA-256) short-circuits to
//! `Complete` without touching the embedder or the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::models::{
    ChangeType, Chunk, Document, FileChangeEvent, IngestOutcome, IngestState, IngestStep,
};
use crate::store::VectorStore;

/// Bounded retries for a storage backend that reports itself unavailable.
const STORE_RETRIES: u32 = 2;

pub struct IngestionCoordinator {
    store: VectorStore,
    embedder: Embedder,
    chunking: ChunkingConfig,
    /// Per-document locks: at most one in-flight ingestion per file path.
    /// A second event for the same path waits here instead of interleaving.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IngestionCoordinator {
    pub fn new(store: VectorStore, embedder: Embedder, chunking: ChunkingConfig) -> Self {
        Self {
            store,
            embedder,
            chunking,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reject obviously malformed events before any work is scheduled.
    pub fn validate(event: &FileChangeEvent) -> Result<(), PipelineError> {
        if event.file_path.trim().is_empty() {
            return Err(PipelineError::MalformedInput("file_path is empty".into()));
        }
        Ok(())
    }

    /// Process one file change event to a terminal state.
    ///
    /// Never returns an error: every failure path ends in an
    /// [`IngestState::Failed`] outcome carrying the failure detail, so the
    /// caller always observes a terminal state.
    pub async fn process_event(&self, event: &FileChangeEvent) -> IngestOutcome {
        if let Err(e) = Self::validate(event) {
            return failed(None, IngestStep::Read, e.to_string());
        }

        let outcome = {
            let lock = self.document_lock(&event.file_path);
            let _guard = lock.lock().await;

            match event.change_type {
                ChangeType::Deleted => self.process_delete(&event.file_path).await,
                ChangeType::Created | ChangeType::Modified => {
                    self.process_upsert(&event.file_path).await
                }
            }
        };

        self.evict_idle_lock(&event.file_path);
        outcome
    }

    async fn process_delete(&self, file_path: &str) -> IngestOutcome {
        match self.store.delete_by_document(file_path).await {
            Ok(true) => IngestOutcome {
                document_id: None,
                state: IngestState::Complete,
                failed_at: None,
                chunks_written: 0,
                detail: format!("document '{}' and associated chunks deleted", file_path),
            },
            Ok(false) => IngestOutcome {
                document_id: None,
                state: IngestState::Complete,
                failed_at: None,
                chunks_written: 0,
                detail: format!("no document found for '{}'", file_path),
            },
            Err(e) => failed(None, IngestStep::Store, e.to_string()),
        }
    }

    async fn process_upsert(&self, file_path: &str) -> IngestOutcome {
        // Read: an unreadable path is malformed input, rejected before
        // any external call.
        let content = match tokio::fs::read_to_string(file_path).await {
            Ok(c) => c,
            Err(e) => {
                return failed(
                    None,
                    IngestStep::Read,
                    PipelineError::MalformedInput(format!("cannot read '{}': {}", file_path, e))
                        .to_string(),
                );
            }
        };

        let content_hash = hash_content(&content);

        let existing = match self.store.get_document_by_path(file_path).await {
            Ok(doc) => doc,
            Err(e) => return failed(None, IngestStep::Store, e.to_string()),
        };

        // Unchanged content: idempotent short-circuit, no embedding cost.
        if let Some(ref doc) = existing {
            if doc.content_hash == content_hash {
                tracing::debug!(file_path, "content unchanged, skipping re-ingestion");
                return IngestOutcome {
                    document_id: Some(doc.id.clone()),
                    state: IngestState::Complete,
                    failed_at: None,
                    chunks_written: 0,
                    detail: "file unchanged".to_string(),
                };
            }
        }

        let now = chrono::Utc::now().timestamp();
        let document = Document {
            id: existing
                .as_ref()
                .map(|d| d.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            file_path: file_path.to_string(),
            content: content.clone(),
            content_hash,
            created_at: existing.as_ref().map(|d| d.created_at).unwrap_or(now),
            updated_at: now,
        };

        // Chunking
        let texts = chunk_text(
            &content,
            self.chunking.chunk_size,
            self.chunking.chunk_overlap,
        );

        // Embedding: fully materialized before the store sees anything, so
        // a provider failure leaves the previous revision untouched.
        let vectors = match self.embedder.embed_texts(&texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(file_path, error = %e, "embedding failed, ingestion aborted");
                return failed(Some(document.id), IngestStep::Embed, e.to_string());
            }
        };

        let chunks: Vec<Chunk> = texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, embedding))| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document.id.clone(),
                chunk_index: i as i64,
                content: text,
                embedding,
                created_at: now,
            })
            .collect();

        // Upserting, with bounded retry when storage is unavailable.
        let chunk_count = chunks.len();
        let mut attempt = 0u32;
        loop {
            match self.store.upsert_chunks(&document, &chunks).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < STORE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(file_path, attempt, error = %e, "store upsert failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250 << attempt)).await;
                }
                Err(e) => return failed(Some(document.id), IngestStep::Store, e.to_string()),
            }
        }

        tracing::info!(file_path, chunks = chunk_count, "document ingested");
        IngestOutcome {
            document_id: Some(document.id),
            state: IngestState::Complete,
            failed_at: None,
            chunks_written: chunk_count,
            detail: format!("file '{}' processed successfully", file_path),
        }
    }

    /// Number of per-document locks currently tracked. Idle entries are
    /// evicted after each event, so this reflects in-flight paths only.
    pub fn active_locks(&self) -> usize {
        self.locks.lock().expect("lock map poisoned").len()
    }

    fn document_lock(&self, file_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(file_path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop a path's lock entry once nothing holds or waits on it, keeping
    /// the map from growing with every path ever seen. Waiters hold clones
    /// of the entry, so a strong count of 1 means the map is the only owner.
    fn evict_idle_lock(&self, file_path: &str) {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        if let Some(entry) = locks.get(file_path) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(file_path);
            }
        }
    }
}

fn failed(document_id: Option<String>, step: IngestStep, detail: String) -> IngestOutcome {
    IngestOutcome {
        document_id,
        state: IngestState::Failed,
        failed_at: Some(step),
        chunks_written: 0,
        detail,
    }
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
