//! Pipeline error taxonomy.
//!
//! Every failure in the ingestion or query pipeline maps to one of these
//! variants. The split determines retry behavior: transient provider errors
//! and storage unavailability are retryable, everything else fails fast.

use thiserror::Error;

/// Errors produced by the ingestion and query pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rate limit, timeout, or server-side provider failure. Retried with
    /// exponential backoff up to a bounded attempt count.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Authentication or invalid-input provider failure. Never retried.
    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    /// The storage backend could not be reached. Retryable at the
    /// coordinator level.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    /// A data invariant was violated (e.g. embedding dimensionality does
    /// not match the store's configured dimensionality). Indicates
    /// misconfiguration; never retried.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Input rejected before any external call (invalid file path, empty
    /// question, unknown change type).
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl PipelineError {
    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientProvider(_) | PipelineError::StorageUnavailable(_)
        )
    }

    /// Short machine-readable kind, used in stream `error` events and HTTP
    /// error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientProvider(_) => "transient_provider",
            PipelineError::PermanentProvider(_) => "permanent_provider",
            PipelineError::StorageUnavailable(_) => "storage_unavailable",
            PipelineError::ConstraintViolation(_) => "constraint_violation",
            PipelineError::MalformedInput(_) => "malformed_input",
        }
    }
}
