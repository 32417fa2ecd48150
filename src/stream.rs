//! Stream encoding for query responses.
//!
//! Bridges the assembled context and the generator's fragment stream into
//! an ordered sequence of typed [`StreamEvent`]s: one `context` event
//! first, an `answer` event per fragment, and exactly one terminal
//! `complete` or `error` event. Each event is forwarded as soon as it is
//! available rather than buffered until completion.
//!
//! The encoder runs as its own task feeding a channel. When the caller
//! disconnects (receiver dropped), the first failed send stops the task
//! and drops the fragment stream, cancelling in-flight generation. The
//! query path is read-only, so cancellation never leaves partial writes.

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::context::estimate_tokens;
use crate::generate::FragmentStream;
use crate::models::{ContextSnippet, QueryAnswer, StreamEvent};

/// Channel capacity between the encoder task and the caller. Small on
/// purpose: a slow consumer backpressures generation instead of buffering
/// the whole answer.
const EVENT_BUFFER: usize = 16;

/// Encode a query response into a stream of [`StreamEvent`]s.
pub fn encode(
    snippets: Vec<ContextSnippet>,
    mut fragments: FragmentStream,
) -> ReceiverStream<StreamEvent> {
    let (tx, rx) = tokio::sync::mpsc::channel(EVENT_BUFFER);

    tokio::spawn(async move {
        let context_count = snippets.len();

        if tx.send(StreamEvent::Context { snippets }).await.is_err() {
            return;
        }

        let mut answer = String::new();

        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => {
                    answer.push_str(&fragment);
                    if tx
                        .send(StreamEvent::Answer { text: fragment })
                        .await
                        .is_err()
                    {
                        return; // caller disconnected; drop the generator
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                            kind: e.kind().to_string(),
                        })
                        .await;
                    return;
                }
            }
        }

        let token_count = estimate_tokens(&answer);
        let _ = tx
            .send(StreamEvent::Complete(QueryAnswer {
                answer,
                token_count,
                context_count,
            }))
            .await;
    });

    ReceiverStream::new(rx)
}
