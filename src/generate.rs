//! Answer generation.
//!
//! The [`GenerationProvider`] trait produces a lazy, finite, non-restartable
//! stream of answer fragments; concatenated in emission order they form the
//! full answer. A mid-generation provider failure surfaces as an `Err` item
//! in the stream, never a silent truncation.
//!
//! [`OpenAiGenerator`] implements the trait over the chat completions API
//! with `stream: true`, parsing the SSE `data:` lines for incremental
//! `delta.content` fragments until the `[DONE]` sentinel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::GenerationConfig;
use crate::error::PipelineError;

/// A finite, ordered sequence of answer fragments.
pub type FragmentStream = BoxStream<'static, Result<String, PipelineError>>;

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Start generating an answer for `prompt`, returning the fragment
    /// stream. Errors returned here mean generation never started; errors
    /// inside the stream mean it failed mid-generation.
    async fn stream_answer(&self, prompt: &str) -> Result<FragmentStream, PipelineError>;
}

/// Build the RAG prompt from the question, the rendered context block, and
/// optional prior turns (oldest first).
pub fn build_prompt(question: &str, context: &str, history: &[String]) -> String {
    let mut prompt = String::from(
        "You are an assistant answering questions about the user's notes. \
         Use the provided context to answer. If the context does not contain \
         the answer, say that you could not find it in the notes.\n\nContext:\n",
    );

    if context.is_empty() {
        prompt.push_str("No relevant context was found in the notes.\n");
    } else {
        prompt.push_str(context);
        prompt.push('\n');
    }

    if !history.is_empty() {
        prompt.push_str("\nPrevious conversation:\n");
        for turn in history {
            prompt.push_str(turn);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nQuestion: ");
    prompt.push_str(question);
    prompt.push_str("\nAnswer:");
    prompt
}

// ============ OpenAI Provider ============

/// Streaming generation over the OpenAI chat completions API.
pub struct OpenAiGenerator {
    model: String,
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiGenerator {
    /// Create a new OpenAI generator from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            client,
            base_url: "https://api.openai.com".to_string(),
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_answer(&self, prompt: &str) -> Result<FragmentStream, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": true,
        });

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::TransientProvider(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let message = format!("OpenAI API error {}: {}", status, body_text);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                PipelineError::TransientProvider(message)
            } else {
                PipelineError::PermanentProvider(message)
            });
        }

        // Bridge the SSE body into a fragment channel. Dropping the
        // receiver stops the reader task and aborts the in-flight request,
        // which is how caller disconnects cancel generation.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, PipelineError>>(16);
        let mut bytes = resp.bytes_stream();

        tokio::spawn(async move {
            let mut buf = String::new();

            while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx
                            .send(Err(PipelineError::TransientProvider(format!(
                                "stream interrupted: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };

                buf.push_str(&String::from_utf8_lossy(&piece));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);

                    match parse_sse_line(&line) {
                        SseLine::Fragment(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return; // caller disconnected
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Ignore => {}
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

enum SseLine {
    Fragment(String),
    Done,
    Ignore,
}

/// Parse one SSE line from an OpenAI-style streaming response.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return SseLine::Ignore;
    };

    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseLine::Ignore;
    };

    match json["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseLine::Fragment(text.to_string()),
        _ => SseLine::Ignore,
    }
}

/// Create the configured [`GenerationProvider`].
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_fragment() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        match parse_sse_line(line) {
            SseLine::Fragment(text) => assert_eq!(text, "Hel"),
            _ => panic!("expected fragment"),
        }
    }

    #[test]
    fn test_parse_sse_done() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
    }

    #[test]
    fn test_parse_sse_ignores_noise() {
        assert!(matches!(parse_sse_line(""), SseLine::Ignore));
        assert!(matches!(parse_sse_line(": keepalive"), SseLine::Ignore));
        assert!(matches!(
            parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#),
            SseLine::Ignore
        ));
    }

    #[test]
    fn test_prompt_contains_context_and_question() {
        let prompt = build_prompt("What is Rust?", "Rust is a language.", &[]);
        assert!(prompt.contains("Rust is a language."));
        assert!(prompt.contains("Question: What is Rust?"));
        assert!(!prompt.contains("Previous conversation"));
    }

    #[test]
    fn test_prompt_signals_missing_context() {
        let prompt = build_prompt("What is Rust?", "", &[]);
        assert!(prompt.contains("No relevant context was found"));
    }

    #[test]
    fn test_prompt_appends_history_in_order() {
        let history = vec!["Q: earlier?".to_string(), "A: earlier answer".to_string()];
        let prompt = build_prompt("And now?", "ctx", &history);
        let q = prompt.find("Q: earlier?").unwrap();
        let a = prompt.find("A: earlier answer").unwrap();
        let question = prompt.find("Question: And now?").unwrap();
        assert!(q < a && a < question);
    }
}
