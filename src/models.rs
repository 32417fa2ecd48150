//! Core data models used throughout note-rags.
//!
//! These types represent the documents, chunks, events, and stream payloads
//! that flow through the ingestion and query pipelines.

use serde::{Deserialize, Serialize};

/// A document ingested from a file change event.
///
/// Documents are superseded, not mutated: a content change replaces the
/// chunk set for the document in a single transaction.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub file_path: String,
    pub content: String,
    /// SHA-256 of `content`, used for idempotent re-ingestion.
    pub content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A chunk of a document's text with its embedding vector.
///
/// Chunk ordinals are contiguous per document starting at 0. Chunks are
/// immutable once written.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: i64,
}

/// A chunk returned from similarity search with its cosine score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub score: f32,
    pub created_at: i64,
}

/// Kind of file change reported to the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// A file change event, the trigger for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub file_path: String,
    pub change_type: ChangeType,
}

/// Terminal state of an ingestion run. Every event ends in exactly one of
/// these; on failure the previous revision's chunks stay queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Complete,
    Failed,
}

/// Pipeline step a failed ingestion stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStep {
    /// Validating the event or reading the file.
    Read,
    /// Calling the embedding provider.
    Embed,
    /// Reading from or writing to the vector store.
    Store,
}

/// Outcome reported by the coordinator after an ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: Option<String>,
    pub state: IngestState,
    /// Set when `state` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<IngestStep>,
    pub chunks_written: usize,
    pub detail: String,
}

/// A natural-language query submitted to the query pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Prior conversation turns, oldest first. Appended to the prompt.
    #[serde(default)]
    pub history: Vec<String>,
    /// Overrides the configured top-k when present.
    #[serde(default)]
    pub top_k: Option<i64>,
    /// Overrides the configured similarity threshold when present.
    #[serde(default)]
    pub threshold: Option<f32>,
}

/// A retrieved context snippet included in the stream's `context` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnippet {
    pub document_id: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: String,
}

/// A typed event in a query response stream.
///
/// Exactly one `complete` or `error` event terminates every stream, and it
/// is the last event. `context` is emitted once before the first `answer`;
/// concatenating `answer` fragments in order reconstructs `complete.answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Context { snippets: Vec<ContextSnippet> },
    Answer { text: String },
    Complete(QueryAnswer),
    Error { message: String, kind: String },
}

/// Payload of the terminal `complete` event, also returned whole by the
/// non-streaming query endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub token_count: usize,
    pub context_count: usize,
}
