//! Query pipeline orchestration.
//!
//! Ties Retriever → ContextAssembler → Generator → StreamEncoder together.
//! Failures before the first event (empty question, embedding or search
//! errors, generation refusing to start) surface synchronously; failures
//! after streaming has begun become the stream's terminal `error` event.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::context::ContextAssembler;
use crate::error::PipelineError;
use crate::generate::{build_prompt, GenerationProvider};
use crate::models::{QueryAnswer, QueryRequest, StreamEvent};
use crate::retrieve::Retriever;
use crate::stream::encode;

#[derive(Clone)]
pub struct QueryPipeline {
    retriever: Retriever,
    assembler: ContextAssembler,
    generator: Arc<dyn GenerationProvider>,
}

impl QueryPipeline {
    pub fn new(
        retriever: Retriever,
        assembler: ContextAssembler,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            retriever,
            assembler,
            generator,
        }
    }

    /// Answer a query as a stream of [`StreamEvent`]s.
    ///
    /// The returned stream always begins with a `context` event and ends
    /// with exactly one `complete` or `error` event.
    pub async fn stream(
        &self,
        request: &QueryRequest,
    ) -> Result<ReceiverStream<StreamEvent>, PipelineError> {
        let ranked = self
            .retriever
            .retrieve(&request.text, request.top_k, request.threshold)
            .await?;

        let context = self.assembler.assemble(&ranked);
        tracing::debug!(
            snippets = context.snippets.len(),
            "context assembled for query"
        );

        let prompt = build_prompt(&request.text, &context.rendered, &request.history);
        let fragments = self.generator.stream_answer(&prompt).await?;

        Ok(encode(context.snippets, fragments))
    }

    /// Answer a query as a single payload (non-streaming variant).
    ///
    /// Drains the event stream and returns the terminal `complete` payload,
    /// or the terminal error.
    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryAnswer, PipelineError> {
        let mut events = self.stream(request).await?;

        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Complete(payload) => return Ok(payload),
                StreamEvent::Error { message, kind } => {
                    // Only generation runs after streaming starts, so the
                    // terminal error is always a provider error.
                    return Err(if kind == "transient_provider" {
                        PipelineError::TransientProvider(message)
                    } else {
                        PipelineError::PermanentProvider(message)
                    });
                }
                StreamEvent::Context { .. } | StreamEvent::Answer { .. } => {}
            }
        }

        Err(PipelineError::PermanentProvider(
            "stream ended without a terminal event".into(),
        ))
    }
}
