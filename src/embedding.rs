//! Embedding provider abstraction and the shared [`Embedder`] front end.
//!
//! The [`EmbeddingProvider`] trait is the raw, single-shot interface to an
//! embedding backend. [`Embedder`] wraps a provider with the policy both
//! pipelines share:
//!
//! - **Batching** — texts are sent in batches up to `batch_size` per call.
//! - **Bounded concurrency** — a semaphore caps concurrent provider calls
//!   across ingestion and query traffic; saturated callers wait rather
//!   than fail.
//! - **Retry** — transient failures (HTTP 429, 5xx, network errors) are
//!   retried with exponential backoff (1s, 2s, 4s… capped) up to
//!   `max_retries`; permanent failures (auth, invalid input) fail fast.
//!
//! Also provides vector utilities used by the store:
//! [`vec_to_blob`] / [`blob_to_vec`] for little-endian f32 BLOB storage and
//! [`cosine_similarity`] for ranking.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::EmbeddingConfig;
use crate::error::PipelineError;

/// Raw interface to an embedding backend. One call, one batch, no policy.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, order preserved.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Shared embedding front end: batching, bounded concurrency, retry.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
    max_retries: u32,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        }
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a list of texts, batched and order-preserved.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let vectors = self.embed_batch_with_retry(batch).await?;
            if vectors.len() != batch.len() {
                return Err(PipelineError::PermanentProvider(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for vec in &vectors {
                if vec.len() != self.provider.dims() {
                    return Err(PipelineError::ConstraintViolation(format!(
                        "embedding has {} dims, expected {}",
                        vec.len(),
                        self.provider.dims()
                    )));
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let results = self.embed_texts(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::PermanentProvider("empty embedding response".into()))
    }

    async fn embed_batch_with_retry(
        &self,
        batch: &[String],
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        // Waiting for a permit is the backpressure point; calls never fail
        // because the limit is saturated.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PipelineError::PermanentProvider("embedder shut down".into()))?;

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.provider.embed(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "embedding call failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| PipelineError::TransientProvider("retries exhausted".into())))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbeddings {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiEmbeddings {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            client,
            base_url: "https://api.openai.com".to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::TransientProvider(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| PipelineError::TransientProvider(e.to_string()))?;
            return parse_openai_response(&json);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(PipelineError::TransientProvider(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )))
        } else {
            Err(PipelineError::PermanentProvider(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )))
        }
    }
}

/// Parse the OpenAI embeddings API response JSON, returning vectors in
/// input order.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, PipelineError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            PipelineError::PermanentProvider("invalid response: missing data array".into())
        })?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                PipelineError::PermanentProvider("invalid response: missing embedding".into())
            })?;

        let mut vec = Vec::with_capacity(embedding.len());
        for v in embedding {
            let value = v.as_f64().ok_or_else(|| {
                PipelineError::PermanentProvider(
                    "invalid response: non-numeric embedding value".into(),
                )
            })?;
            vec.push(value as f32);
        }

        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Create the configured [`EmbeddingProvider`].
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbeddings::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
