//! Agent Runtime: the agent contract and the three built-in agents.
//!
//! The closed event set is a tagged enum (`#[serde(tag = "type")]`), the
//! same style as the teacher's `ConversationState`/`MessageType`
//! (`db::schema`). The lazy-sequence shape reuses the teacher's
//! channel-as-sequence idiom from `runtime::mod`'s broadcast `SseEvent`,
//! specialized to a bounded `mpsc` channel per agent invocation.

pub mod normal;
pub mod orchestrator;
pub mod providers;
pub mod rag;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use self::providers::{EmbeddingsProvider, LlmProvider, RetrievalProvider};
use crate::agents::providers::LlmMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Thoughts,
    FinalAnswer,
}

/// The closed set of event kinds an agent may emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Metadata {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        citations: Option<Vec<Citation>>,
        stream_id: String,
    },
    AgentUpdated {
        agent_name: String,
        content_type: ContentType,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_description: Option<String>,
    },
    Data {
        answer: String,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// Everything an agent needs for one invocation.
#[derive(Clone)]
pub struct RunContext {
    pub trace_id: String,
    pub user_id: String,
    pub session_id: String,
    pub stream_id: String,
    pub message_history: Vec<LlmMessage>,
    pub cancellation: CancellationToken,
    pub retrieval_timeout: Duration,
    pub llm: Arc<dyn LlmProvider>,
    pub embeddings: Arc<dyn EmbeddingsProvider>,
    pub retrieval: Arc<dyn RetrievalProvider>,
}

pub type AgentEventSender = mpsc::Sender<AgentEvent>;

/// An agent produces a lazy, ordered sequence of `AgentEvent`s for a given
/// run context. `run` drives the sequence by sending into `tx`; the
/// returned `run` future completes once the sequence is exhausted.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: RunContext, tx: AgentEventSender);
}

/// Channel capacity for the per-invocation event stream (SPEC_FULL.md 5,
/// backpressure).
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Invoke `agent` and return its event sequence as a `Stream`, the idiom
/// the transport (`api::sse`) and coordinator both consume.
pub fn run_agent(
    agent: Arc<dyn Agent>,
    ctx: RunContext,
) -> ReceiverStream<AgentEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        agent.run(ctx, tx).await;
    });
    ReceiverStream::new(rx)
}

/// Resolve an `agentType` string to a built-in agent. Unknown types fall
/// back to `normal` (SPEC_FULL.md 4.4 step 4).
pub fn resolve_agent(agent_type: &str) -> Arc<dyn Agent> {
    match agent_type {
        "rag" => Arc::new(rag::RagAgent),
        "multi-agent" | "orchestrator" => Arc::new(orchestrator::OrchestratorAgent),
        "normal" => Arc::new(normal::NormalAgent),
        other => {
            tracing::warn!(agent_type = other, "unknown agent type, falling back to normal");
            Arc::new(normal::NormalAgent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agent_type_falls_back_to_normal() {
        assert_eq!(resolve_agent("nonexistent").name(), "normal");
    }

    #[test]
    fn known_agent_types_resolve() {
        assert_eq!(resolve_agent("normal").name(), "normal");
        assert_eq!(resolve_agent("rag").name(), "rag");
        assert_eq!(resolve_agent("multi-agent").name(), "orchestrator");
    }
}
