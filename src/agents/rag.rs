//! Retrieval-augmented agent: embed the latest query, retrieve top-K
//! passages, prepend them as system context, then stream as `normal` does.

use async_trait::async_trait;

use super::normal::stream_answer;
use super::providers::RetrievalFilters;
use super::{Agent, AgentEvent, AgentEventSender, Citation, ContentType, RunContext};

const DEFAULT_TOP_K: usize = 10;

pub struct RagAgent;

#[async_trait]
impl Agent for RagAgent {
    fn name(&self) -> &'static str {
        "rag"
    }

    async fn run(&self, ctx: RunContext, tx: AgentEventSender) {
        let query = ctx
            .message_history
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let filters = RetrievalFilters {
            user_id: Some(ctx.user_id.clone()),
            thread_id: Some(ctx.session_id.clone()),
        };

        let query_embedding = ctx
            .embeddings
            .embed(&[query])
            .await
            .ok()
            .and_then(|mut vectors| vectors.pop())
            .unwrap_or_default();

        let passages = tokio::time::timeout(
            ctx.retrieval_timeout,
            ctx.retrieval.search(&query_embedding, DEFAULT_TOP_K, &filters),
        )
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

        let citations: Vec<Citation> = passages
            .iter()
            .map(|p| Citation {
                title: p
                    .metadata
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("untitled")
                    .to_string(),
                source: p.metadata.get("source").and_then(|v| v.as_str()).map(String::from),
                snippet: Some(p.content.chars().take(240).collect()),
                score: Some(p.score),
            })
            .collect();

        if tx
            .send(AgentEvent::Metadata {
                trace_id: ctx.trace_id.clone(),
                citations: Some(citations),
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

        let context_block = passages
            .iter()
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let system_prompt = if context_block.is_empty() {
            None
        } else {
            Some(format!("Relevant context:\n{context_block}"))
        };

        stream_answer(&ctx, &tx, system_prompt.as_deref(), &ctx.message_history).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::{
        MockEmbeddingsProvider, MockLlmProvider, MockRetrievalProvider, RetrievedPassage,
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn metadata_carries_citations_from_retrieval() {
        let ctx = RunContext {
            trace_id: "trace-1".into(),
            user_id: "u1".into(),
            session_id: "t1".into(),
            stream_id: "s1".into(),
            message_history: vec![super::super::providers::LlmMessage {
                role: super::super::providers::LlmRole::User,
                content: "what is rust".into(),
            }],
            cancellation: CancellationToken::new(),
            retrieval_timeout: std::time::Duration::from_secs(5),
            llm: Arc::new(MockLlmProvider::scripted(["Rust is a language"])),
            embeddings: Arc::new(MockEmbeddingsProvider { dimension: 4 }),
            retrieval: Arc::new(MockRetrievalProvider {
                passages: vec![RetrievedPassage {
                    id: "p1".into(),
                    content: "Rust is a systems programming language.".into(),
                    score: 0.9,
                    metadata: serde_json::json!({"title": "Rust overview"}),
                }],
            }),
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        RagAgent.run(ctx, tx).await;

        let first = rx.recv().await.unwrap();
        match first {
            AgentEvent::Metadata { citations, .. } => {
                let citations = citations.unwrap();
                assert_eq!(citations.len(), 1);
                assert_eq!(citations[0].title, "Rust overview");
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }
}
