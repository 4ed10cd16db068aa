//! Orchestrator agent: deterministic planner -> (optional) researcher ->
//! writer sequencing.
//!
//! The sub-agent handoff shape is grounded conceptually on
//! `other_examples/.../codex-rs-core-src-subagents-orchestrator.rs.rs`
//! (sequential execution plan, per-step timeout/retry), simplified here to
//! the one fixed three-step pipeline this spec pins (no dynamic routing,
//! no parallel branches — see SPEC_FULL.md 9, Design Notes).

use async_trait::async_trait;
use futures::StreamExt;

use super::providers::{LlmMessage, LlmParams, LlmStreamEvent, RetrievalFilters};
use super::{Agent, AgentEvent, AgentEventSender, ContentType, RunContext};

pub struct OrchestratorAgent;

struct Plan {
    summary: String,
    requires_research: bool,
    steps: Vec<String>,
}

#[async_trait]
impl Agent for OrchestratorAgent {
    fn name(&self) -> &'static str {
        "orchestrator"
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

        let plan = match run_planner(&ctx, &tx).await {
            Some(p) => p,
            None => return,
        };

        let mut findings = String::new();
        if plan.requires_research {
            match run_researcher(&ctx, &tx).await {
                Some(f) => findings = f,
                None => return,
            }
        }

        run_writer(&ctx, &tx, &plan, &findings).await;
    }
}

async fn run_planner(ctx: &RunContext, tx: &AgentEventSender) -> Option<Plan> {
    if tx
        .send(AgentEvent::AgentUpdated {
            agent_name: "planner".to_string(),
            content_type: ContentType::Thoughts,
            job_description: Some("Drafting a plan".to_string()),
        })
        .await
        .is_err()
    {
        return None;
    }

    let query = ctx.message_history.last().map(|m| m.content.as_str()).unwrap_or("");
    let requires_research = looks_like_it_needs_research(query);

    let summary = if requires_research {
        format!("I'll research \"{query}\" before answering.")
    } else {
        "I can answer this directly.".to_string()
    };

    let steps = if requires_research {
        vec!["Research the query".to_string(), "Write the answer".to_string()]
    } else {
        vec!["Write the answer".to_string()]
    };

    if tx
        .send(AgentEvent::Data {
            answer: summary.clone(),
        })
        .await
        .is_err()
    {
        return None;
    }

    Some(Plan {
        summary,
        requires_research,
        steps,
    })
}

fn looks_like_it_needs_research(query: &str) -> bool {
    let lowered = query.to_lowercase();
    ["latest", "current", "today", "recent", "search", "look up"]
        .iter()
        .any(|kw| lowered.contains(kw))
}

async fn run_researcher(ctx: &RunContext, tx: &AgentEventSender) -> Option<String> {
    if tx
        .send(AgentEvent::AgentUpdated {
            agent_name: "researcher".to_string(),
            content_type: ContentType::Thoughts,
            job_description: Some("Gathering findings".to_string()),
        })
        .await
        .is_err()
    {
        return None;
    }

    let query = ctx.message_history.last().map(|m| m.content.clone()).unwrap_or_default();
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
        ctx.retrieval.search(&query_embedding, 10, &filters),
    )
    .await
    .ok()
    .and_then(Result::ok)
    .unwrap_or_default();

    let findings: String = passages
        .iter()
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let summary = if findings.is_empty() {
        "No additional findings.".to_string()
    } else {
        format!("Found {} relevant passages.", passages.len())
    };
    if tx.send(AgentEvent::Data { answer: summary }).await.is_err() {
        return None;
    }

    Some(findings)
}

async fn run_writer(ctx: &RunContext, tx: &AgentEventSender, plan: &Plan, findings: &str) {
    if tx
        .send(AgentEvent::AgentUpdated {
            agent_name: "writer".to_string(),
            content_type: ContentType::FinalAnswer,
            job_description: None,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut prompt_sections = vec![format!("Plan:\n{}", plan.summary)];
    if !findings.is_empty() {
        prompt_sections.push(format!("Research findings to incorporate:\n{findings}"));
    }
    let system_prompt = Some(prompt_sections.join("\n\n"));

    let messages: Vec<LlmMessage> = ctx.message_history.clone();
    let stream_result = ctx
        .llm
        .stream_complete(
            system_prompt.as_deref(),
            &messages,
            &LlmParams::default(),
            ctx.cancellation.clone(),
        )
        .await;

    let mut stream = match stream_result {
        Ok(s) => s,
        Err(e) => {
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
                    Some(Ok(LlmStreamEvent::Done { .. })) | None => {
                        let _ = tx.send(AgentEvent::Done { message_id: None, stream_id: Some(ctx.stream_id.clone()) }).await;
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(AgentEvent::Error { error: e.message, code: Some("AGENT_ERROR".to_string()) }).await;
                        return;
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

    fn ctx_with_query(query: &str) -> RunContext {
        RunContext {
            trace_id: "trace-1".into(),
            user_id: "u1".into(),
            session_id: "t1".into(),
            stream_id: "s1".into(),
            message_history: vec![LlmMessage {
                role: super::super::providers::LlmRole::User,
                content: query.into(),
            }],
            cancellation: CancellationToken::new(),
            retrieval_timeout: std::time::Duration::from_secs(5),
            llm: Arc::new(MockLlmProvider::scripted(["final answer"])),
            embeddings: Arc::new(MockEmbeddingsProvider { dimension: 4 }),
            retrieval: Arc::new(MockRetrievalProvider { passages: vec![] }),
        }
    }

    #[tokio::test]
    async fn sequences_planner_then_writer_without_research() {
        let ctx = ctx_with_query("what is 2+2");
        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        OrchestratorAgent.run(ctx, tx).await;

        let mut agent_names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::AgentUpdated { agent_name, .. } = event {
                agent_names.push(agent_name);
            }
        }
        assert_eq!(agent_names, vec!["planner", "writer"]);
    }

    #[tokio::test]
    async fn sequences_planner_researcher_writer_when_research_needed() {
        let ctx = ctx_with_query("what is the latest rust release");
        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        OrchestratorAgent.run(ctx, tx).await;

        let mut agent_names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::AgentUpdated { agent_name, .. } = event {
                agent_names.push(agent_name);
            }
        }
        assert_eq!(agent_names, vec!["planner", "researcher", "writer"]);
    }
}
