//! Normal agent: direct LLM streaming, no retrieval. Grounded on the
//! `LlmService`/`LoggingService` shape of the teacher's `llm.rs` (one
//! provider call per turn, usage logged at `info`).

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{error, info};

use super::providers::{LlmParams, LlmStreamEvent};
use super::retry::RetryPolicy;
use super::{Agent, AgentEvent, AgentEventSender, ContentType, RunContext};

pub struct NormalAgent;

#[async_trait]
impl Agent for NormalAgent {
    fn name(&self) -> &'static str {
        "normal"
    }

    async fn run(&self, ctx: RunContext, tx: AgentEventSender) {
        if tx
            .send(AgentEvent::Metadata {
                trace_id: ctx.trace_id.clone(),
                citations: None,
                stream_id: ctx.stream_id.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        if tx
            .send(AgentEvent::AgentUpdated {
                agent_name: self.name().to_string(),
                content_type: ContentType::FinalAnswer,
                job_description: None,
            })
            .await
            .is_err()
        {
            return;
        }

        stream_answer(&ctx, &tx, None, &ctx.message_history).await;
    }
}

/// Shared by `normal` and `rag`: drive an LLM stream to completion, with
/// Transient-error retry bounded by `RetryPolicy`, emitting `data` events as
/// deltas arrive and a terminal `done`/`error` event.
pub(super) async fn stream_answer(
    ctx: &RunContext,
    tx: &AgentEventSender,
    system_prompt: Option<&str>,
    messages: &[super::providers::LlmMessage],
) {
    let policy = RetryPolicy::default();
    let mut attempt = 0u32;

    loop {
        let stream_result = ctx
            .llm
            .stream_complete(
                system_prompt,
                messages,
                &LlmParams::default(),
                ctx.cancellation.clone(),
            )
            .await;

        let mut stream = match stream_result {
            Ok(s) => s,
            Err(e) if e.kind.is_retryable() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                tokio::time::sleep(policy.calculate_delay(attempt)).await;
                continue;
            }
            Err(e) => {
                error!(error = %e.message, retryable = e.kind.is_retryable(), "llm stream failed");
                let _ = tx
                    .send(AgentEvent::Error {
                        error: e.message,
                        code: Some("UPSTREAM_UNAVAILABLE".to_string()),
                    })
                    .await;
                return;
            }
        };

        loop {
            tokio::select! {
                () = ctx.cancellation.cancelled() => {
                    let _ = tx.send(AgentEvent::Done { message_id: None, stream_id: Some(ctx.stream_id.clone()) }).await;
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(LlmStreamEvent::TextDelta(text))) => {
                            if tx.send(AgentEvent::Data { answer: text }).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(LlmStreamEvent::Done { usage })) => {
                            if let Some(u) = usage {
                                info!(input_tokens = u.input_tokens, output_tokens = u.output_tokens, "llm stream completed");
                            }
                            let _ = tx.send(AgentEvent::Done { message_id: None, stream_id: Some(ctx.stream_id.clone()) }).await;
                            return;
                        }
                        Some(Err(e)) => {
                            error!(error = %e.message, "llm stream error mid-flight");
                            let _ = tx.send(AgentEvent::Error { error: e.message, code: Some("AGENT_ERROR".to_string()) }).await;
                            return;
                        }
                        None => {
                            let _ = tx.send(AgentEvent::Done { message_id: None, stream_id: Some(ctx.stream_id.clone()) }).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::{MockEmbeddingsProvider, MockLlmProvider, MockRetrievalProvider};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_ctx(deltas: &[&str]) -> RunContext {
        RunContext {
            trace_id: "trace-1".into(),
            user_id: "u1".into(),
            session_id: "t1".into(),
            stream_id: "s1".into(),
            message_history: vec![],
            cancellation: CancellationToken::new(),
            retrieval_timeout: std::time::Duration::from_secs(5),
            llm: Arc::new(MockLlmProvider::scripted(deltas.to_vec())),
            embeddings: Arc::new(MockEmbeddingsProvider { dimension: 4 }),
            retrieval: Arc::new(MockRetrievalProvider { passages: vec![] }),
        }
    }

    #[tokio::test]
    async fn emits_metadata_then_agent_updated_then_data_then_done() {
        let ctx = test_ctx(&["Hello", " world"]);
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        NormalAgent.run(ctx, tx).await;

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }

        assert!(matches!(events[0], AgentEvent::Metadata { .. }));
        assert!(matches!(events[1], AgentEvent::AgentUpdated { .. }));
        let concatenated: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Data { answer } => Some(answer.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(concatenated, "Hello world");
        assert!(matches!(events.last().unwrap(), AgentEvent::Done { .. }));
    }
}
