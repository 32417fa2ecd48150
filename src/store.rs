//! Vector store over SQLite.
//!
//! Persists chunks with their embedding vectors and serves approximate
//! nearest-neighbor search (cosine similarity computed in Rust over the
//! stored vectors). The ingestion coordinator is the only writer; the
//! query path is read-only.
//!
//! Writes are transactional at the document level: `upsert_chunks` replaces
//! a document's entire chunk set in one transaction, so either all chunks
//! of a revision are visible or none are.

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;
use crate::models::{Chunk, Document, ScoredChunk};

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    dims: usize,
}

impl VectorStore {
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self { pool, dims }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Look up a document by its file path.
    pub async fn get_document_by_path(
        &self,
        file_path: &str,
    ) -> Result<Option<Document>, PipelineError> {
        let row = sqlx::query(
            "SELECT id, file_path, content, content_hash, created_at, updated_at
             FROM documents WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Document {
            id: r.get("id"),
            file_path: r.get("file_path"),
            content: r.get("content"),
            content_hash: r.get("content_hash"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Replace a document's chunk set atomically.
    ///
    /// Upserts the document row (keyed by file path), deletes all prior
    /// chunks for the document, and inserts the new set — all in a single
    /// transaction, so a failure leaves the previous revision intact.
    pub async fn upsert_chunks(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<(), PipelineError> {
        for chunk in chunks {
            if chunk.embedding.len() != self.dims {
                return Err(PipelineError::ConstraintViolation(format!(
                    "chunk {} has {} dims, store configured for {}",
                    chunk.id,
                    chunk.embedding.len(),
                    self.dims
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, file_path, content, content_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                content = excluded.content,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&document.id)
        .bind(&document.file_path)
        .bind(&document.content)
        .bind(&document.content_hash)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, content, embedding, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a document and all its chunks. Returns whether a document
    /// existed.
    pub async fn delete_by_document(&self, file_path: &str) -> Result<bool, PipelineError> {
        let Some(doc) = self.get_document_by_path(file_path).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Chunk ids and ordinals for a document, ordered by ordinal.
    pub async fn chunk_ids(&self, document_id: &str) -> Result<Vec<(String, i64)>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, chunk_index FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get("id"), r.get("chunk_index")))
            .collect())
    }

    /// Top-k cosine similarity search.
    ///
    /// Results are sorted by descending similarity; ties are broken by most
    /// recent creation timestamp, then id, so ordering is deterministic.
    /// Chunks scoring below `threshold` are excluded when one is given.
    pub async fn search(
        &self,
        query_vector: &[f32],
        top_k: i64,
        threshold: Option<f32>,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        if query_vector.len() != self.dims {
            return Err(PipelineError::ConstraintViolation(format!(
                "query vector has {} dims, store configured for {}",
                query_vector.len(),
                self.dims
            )));
        }

        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding, created_at FROM chunks",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<ScoredChunk> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query_vector, &blob_to_vec(&blob));
                if let Some(t) = threshold {
                    if score < t {
                        return None;
                    }
                }
                Some(ScoredChunk {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    score,
                    created_at: row.get("created_at"),
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(top_k.max(0) as usize);

        Ok(results)
    }
}
