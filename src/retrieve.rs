//! Similarity retrieval for the query pipeline.
//!
//! Embeds the question through the shared [`Embedder`] and runs top-k
//! cosine search against the [`VectorStore`]. An empty result set is a
//! valid outcome, not an error — the generator is told no context was
//! found.

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::models::ScoredChunk;
use crate::store::VectorStore;

#[derive(Clone)]
pub struct Retriever {
    store: VectorStore,
    embedder: Embedder,
    defaults: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: VectorStore, embedder: Embedder, defaults: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            defaults,
        }
    }

    /// Retrieve the chunks most similar to `question`, ranked descending.
    ///
    /// `top_k` and `threshold` override the configured defaults when given.
    pub async fn retrieve(
        &self,
        question: &str,
        top_k: Option<i64>,
        threshold: Option<f32>,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        if question.trim().is_empty() {
            return Err(PipelineError::MalformedInput("question is empty".into()));
        }

        let query_vector = self.embedder.embed_query(question).await?;
        let top_k = top_k.unwrap_or(self.defaults.top_k);
        let threshold = threshold.or(self.defaults.threshold);

        let results = self.store.search(&query_vector, top_k, threshold).await?;
        tracing::debug!(
            question_len = question.len(),
            results = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }
}
