//! Dependency interfaces consumed by the agent runtime: a streaming LLM
//! provider, an embeddings provider, and a retrieval provider.
//!
//! `LlmError`/`LlmErrorKind` are carried over from the teacher's
//! `llm::error` almost verbatim (same classification, same constructors).
//! Streaming itself has no teacher counterpart — the teacher's own
//! `LlmService::complete` is non-streaming — so the HTTP/SSE shape here is
//! grounded on the sibling example `open-agent-sdk-rust`'s `client::query`
//! and `utils::parse_sse_stream`.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::RateLimit, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ServerError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidRequest, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Unknown, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Network,
    RateLimit,
    ServerError,
    Auth,
    InvalidRequest,
    Unknown,
}

impl LlmErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::ServerError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct LlmParams {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// One unit of a streaming completion.
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    TextDelta(String),
    Done { usage: Option<Usage> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a completion for `messages`. Errors end the stream; a
    /// `LlmStreamEvent::Done` item marks normal completion. Implementations
    /// must race their own I/O against `cancellation` so callers observe
    /// cancellation promptly (SPEC_FULL.md 5, suspension points).
    async fn stream_complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[LlmMessage],
        params: &LlmParams,
        cancellation: CancellationToken,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent, LlmError>>, LlmError>;
}

#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPassage {
    pub id: String,
    pub content: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
}

#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    /// `query_embedding` is the caller's already-embedded query
    /// (`EmbeddingsProvider::embed`) — retrieval here is a similarity
    /// search, not free text search.
    async fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievedPassage>, LlmError>;
}

// ============================================================================
// Reference implementation: Anthropic streaming provider
// ============================================================================

pub struct AnthropicStreamingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicStreamingProvider {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            model,
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
        }
    }
}

#[derive(Serialize)]
struct AnthropicStreamRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<AnthropicStreamMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicStreamMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamChunk {
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicStreamingProvider {
    async fn stream_complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[LlmMessage],
        params: &LlmParams,
        cancellation: CancellationToken,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent, LlmError>>, LlmError> {
        let req_messages: Vec<AnthropicStreamMessage> = messages
            .iter()
            .map(|m| AnthropicStreamMessage {
                role: match m.role {
                    LlmRole::User => "user",
                    LlmRole::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let body = AnthropicStreamRequest {
            model: &self.model,
            max_tokens: params.max_output_tokens.unwrap_or(4096),
            stream: true,
            system: system_prompt,
            temperature: params.temperature,
            messages: req_messages,
        };

        let response = tokio::select! {
            resp = self.client
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send() => resp.map_err(|e| LlmError::network(e.to_string()))?,
            () = cancellation.cancelled() => return Err(LlmError::unknown("cancelled before response")),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        Ok(Box::pin(parse_anthropic_sse(response, cancellation)))
    }
}

fn classify_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::auth(format!("authentication failed: {body}")),
        429 => LlmError::rate_limit(format!("rate limited: {body}")),
        400 => LlmError::invalid_request(format!("invalid request: {body}")),
        500..=599 => LlmError::server_error(format!("server error: {body}")),
        _ => LlmError::unknown(format!("HTTP {status}: {body}")),
    }
}

/// Parses the `text/event-stream` body into `LlmStreamEvent`s.
///
/// Grounded on `open-agent-sdk-rust::utils::parse_sse_stream`: iterate the
/// byte stream, split on newlines, only act on `data: ` lines, ignore
/// `[DONE]`. Departure from that sibling: a frame that fails to parse as
/// JSON is logged and skipped rather than turned into a stream error, per
/// this crate's requirement to tolerate malformed intermediate frames.
fn parse_anthropic_sse(
    response: reqwest::Response,
    cancellation: CancellationToken,
) -> impl futures::Stream<Item = Result<LlmStreamEvent, LlmError>> {
    async_stream::stream! {
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                chunk = byte_stream.next() => chunk,
                () = cancellation.cancelled() => {
                    break;
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::network(e.to_string()));
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<AnthropicStreamChunk>(data) {
                    Ok(AnthropicStreamChunk::ContentBlockDelta { delta }) => {
                        if let Some(text) = delta.text {
                            yield Ok(LlmStreamEvent::TextDelta(text));
                        }
                    }
                    Ok(AnthropicStreamChunk::MessageDelta { usage }) => {
                        if let Some(u) = usage {
                            yield Ok(LlmStreamEvent::Done {
                                usage: Some(Usage {
                                    input_tokens: 0,
                                    output_tokens: u.output_tokens,
                                }),
                            });
                        }
                    }
                    Ok(AnthropicStreamChunk::MessageStop) => {
                        yield Ok(LlmStreamEvent::Done { usage: None });
                    }
                    Ok(AnthropicStreamChunk::Other) => {}
                    Err(e) => {
                        warn!(error = %e, frame = data, "skipping malformed SSE frame");
                    }
                }
            }
        }
    }
}

// ============================================================================
// Mock implementations for tests
// ============================================================================

pub struct MockLlmProvider {
    pub deltas: Vec<String>,
}

impl MockLlmProvider {
    pub fn scripted(deltas: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn stream_complete(
        &self,
        _system_prompt: Option<&str>,
        _messages: &[LlmMessage],
        _params: &LlmParams,
        _cancellation: CancellationToken,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent, LlmError>>, LlmError> {
        let mut events: Vec<Result<LlmStreamEvent, LlmError>> = self
            .deltas
            .iter()
            .cloned()
            .map(|d| Ok(LlmStreamEvent::TextDelta(d)))
            .collect();
        events.push(Ok(LlmStreamEvent::Done { usage: None }));
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

pub struct MockEmbeddingsProvider {
    pub dimension: usize,
}

#[async_trait]
impl EmbeddingsProvider for MockEmbeddingsProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|_| vec![0.0; self.dimension]).collect())
    }
}

pub struct MockRetrievalProvider {
    pub passages: Vec<RetrievedPassage>,
}

#[async_trait]
impl RetrievalProvider for MockRetrievalProvider {
    async fn search(
        &self,
        _query_embedding: &[f32],
        k: usize,
        _filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievedPassage>, LlmError> {
        Ok(self.passages.iter().take(k).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_llm_provider_streams_scripted_deltas_then_done() {
        let provider = MockLlmProvider::scripted(["Hello", ", ", "world"]);
        let mut stream = provider
            .stream_complete(
                None,
                &[],
                &LlmParams::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                LlmStreamEvent::TextDelta(d) => text.push_str(&d),
                LlmStreamEvent::Done { .. } => saw_done = true,
            }
        }
        assert_eq!(text, "Hello, world");
        assert!(saw_done);
    }

    #[test]
    fn error_kind_retryability_matches_http_classification() {
        assert!(LlmErrorKind::RateLimit.is_retryable());
        assert!(LlmErrorKind::Network.is_retryable());
        assert!(!LlmErrorKind::Auth.is_retryable());
        assert!(!LlmErrorKind::InvalidRequest.is_retryable());
    }
}
