//! Chat Coordinator: binds a request to an agent, mediates persistence,
//! enforces thread ownership, forwards events.
//!
//! Grounded on the teacher's `runtime::RuntimeManager::get_or_create`
//! (lookup-or-create plus handle issuance) and `runtime::executor`'s
//! `run()`/`select!` event loop shape, generalized away from the
//! bash-tool-execution state machine the teacher built it for.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::providers::{LlmMessage, LlmRole};
use crate::agents::{resolve_agent, run_agent, AgentEvent, RunContext};
use crate::config::Config;
use crate::db::{Database, IfMatch, Role};
use crate::error::{ChatError, ChatResult};
use crate::registry::{RegistrationGuard, StreamRegistry};

/// One turn of inbound conversation, already parsed from the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// A validated `process_chat` request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub thread_id: Option<String>,
    pub user_id: String,
    pub agent_type: String,
    pub messages: Vec<InboundMessage>,
    pub system_prompt: Option<String>,
}

#[derive(Clone)]
pub struct Coordinator {
    db: Database,
    registry: Arc<dyn StreamRegistry>,
    llm: Arc<dyn crate::agents::providers::LlmProvider>,
    embeddings: Arc<dyn crate::agents::providers::EmbeddingsProvider>,
    retrieval: Arc<dyn crate::agents::providers::RetrievalProvider>,
    config: Config,
}

impl Coordinator {
    pub fn new(
        db: Database,
        registry: Arc<dyn StreamRegistry>,
        llm: Arc<dyn crate::agents::providers::LlmProvider>,
        embeddings: Arc<dyn crate::agents::providers::EmbeddingsProvider>,
        retrieval: Arc<dyn crate::agents::providers::RetrievalProvider>,
        config: Config,
    ) -> Self {
        Self {
            db,
            registry,
            llm,
            embeddings,
            retrieval,
            config,
        }
    }

    /// `process_chat(request, cancellation) -> lazy sequence of events`,
    /// SPEC_FULL.md 4.4. The returned stream is consumed by the transport
    /// (`api::sse`); persistence and cleanup happen as a side effect of
    /// driving it to completion.
    pub async fn process_chat(
        &self,
        request: ChatRequest,
        transport_cancellation: CancellationToken,
    ) -> ChatResult<impl Stream<Item = AgentEvent>> {
        let thread = self.resolve_thread(&request).await?;
        let thread_id = thread.id.clone();

        self.persist_user_turn(&thread_id, &request).await?;

        let handle = self.registry.register(&thread_id).await;
        let guard = Arc::new(RegistrationGuard::new(self.registry.clone(), thread_id.clone()));

        let agent = resolve_agent(&request.agent_type);
        let trace_id = Uuid::now_v7().to_string();
        log_request_start(&trace_id, &thread_id, &request.user_id);
        let history = prepare_history(
            &request.messages,
            self.config.history_max_messages,
            self.config.history_max_tokens,
        );

        let cancellation = combine_tokens(&transport_cancellation, &handle.token);

        let run_ctx = RunContext {
            trace_id: trace_id.clone(),
            user_id: request.user_id.clone(),
            session_id: thread_id.clone(),
            stream_id: handle.stream_id.clone(),
            message_history: history,
            cancellation: cancellation.clone(),
            retrieval_timeout: self.config.retrieval_timeout,
            llm: self.llm.clone(),
            embeddings: self.embeddings.clone(),
            retrieval: self.retrieval.clone(),
        };

        let events = run_agent(agent, run_ctx);
        let db = self.db.clone();
        let config = self.config.clone();
        let user_id = request.user_id.clone();

        Ok(drive_and_persist(
            events,
            db,
            thread_id,
            user_id,
            config,
            guard,
            cancellation,
        ))
    }

    async fn resolve_thread(&self, request: &ChatRequest) -> ChatResult<crate::db::Thread> {
        match &request.thread_id {
            Some(id) => {
                let thread = self
                    .db
                    .get_thread(id.clone())
                    .await?
                    .ok_or_else(|| ChatError::NotFound(format!("thread {id}")))?;
                if thread.user_id != request.user_id {
                    return Err(ChatError::Forbidden(format!(
                        "thread {id} is not owned by this user"
                    )));
                }
                Ok(thread)
            }
            None => {
                let id = Uuid::now_v7().to_string();
                let title = request
                    .messages
                    .last()
                    .map(|m| infer_title(&m.content));
                let thread = self
                    .db
                    .create_thread(id, request.user_id.clone(), title, json!({}), None)
                    .await?;
                Ok(thread.value)
            }
        }
    }

    async fn persist_user_turn(
        &self,
        thread_id: &str,
        request: &ChatRequest,
    ) -> ChatResult<Option<crate::db::Message>> {
        let Some(last) = request.messages.last() else {
            return Ok(None);
        };
        if last.role != Role::User {
            return Ok(None);
        }
        let id = last.id.clone().unwrap_or_else(|| Uuid::now_v7().to_string());
        let message = self
            .db
            .upsert_message(
                id,
                thread_id.to_string(),
                request.user_id.clone(),
                Role::User,
                last.content.clone(),
                last.metadata.clone(),
                IfMatch::Any,
            )
            .await?;
        Ok(Some(message.value))
    }
}

/// First 80 characters of `content`, whitespace-collapsed, SPEC_FULL.md 4.4
/// step 1.
fn infer_title(content: &str) -> String {
    let collapsed: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(80).collect()
}

/// `CancellationToken` only propagates parent -> child, so a client
/// disconnect (`transport`) and an explicit `/chat/stop` (`handle`, fired via
/// `Registry.signal`) are merged by racing both and firing one shared token,
/// the way the teacher composes parent/child cancellation in `runtime::traits`.
fn combine_tokens(transport: &CancellationToken, handle: &CancellationToken) -> CancellationToken {
    let combined = CancellationToken::new();
    let transport = transport.clone();
    let handle = handle.clone();
    let combined_clone = combined.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = transport.cancelled() => {}
            () = handle.cancelled() => {}
        }
        combined_clone.cancel();
    });
    combined
}

/// Truncate to the most recent N messages, preserving every `system`
/// message, then trim from the oldest non-system message until the
/// estimated token budget is met (SPEC_FULL.md 4.4 step 5).
fn prepare_history(
    messages: &[InboundMessage],
    max_messages: usize,
    max_tokens: usize,
) -> Vec<LlmMessage> {
    let system: Vec<&InboundMessage> = messages.iter().filter(|m| m.role == Role::System).collect();
    let non_system: Vec<&InboundMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

    let kept_non_system: Vec<&InboundMessage> = non_system
        .iter()
        .rev()
        .take(max_messages.saturating_sub(system.len()).max(1))
        .rev()
        .copied()
        .collect();

    let mut ordered: Vec<&InboundMessage> = Vec::with_capacity(system.len() + kept_non_system.len());
    ordered.extend(system.iter().copied());
    ordered.extend(kept_non_system.iter().copied());
    ordered.sort_by_key(|m| messages.iter().position(|x| std::ptr::eq(x, *m)).unwrap_or(0));

    while estimate_tokens(&ordered) > max_tokens {
        let Some(pos) = ordered.iter().position(|m| m.role != Role::System) else {
            break;
        };
        if ordered.len() <= 1 {
            break;
        }
        ordered.remove(pos);
    }

    ordered
        .into_iter()
        .map(|m| LlmMessage {
            role: match m.role {
                Role::User => LlmRole::User,
                _ => LlmRole::Assistant,
            },
            content: m.content.clone(),
        })
        .collect()
}

/// ~1.3 tokens/word + 0.5/punctuation, a tokenizer-free heuristic stable
/// across languages (SPEC_FULL.md 9, Design Notes).
fn estimate_tokens(messages: &[&InboundMessage]) -> usize {
    messages
        .iter()
        .map(|m| {
            let words = m.content.split_whitespace().count();
            let punctuation = m
                .content
                .chars()
                .filter(|c| c.is_ascii_punctuation())
                .count();
            (words as f64 * 1.3 + punctuation as f64 * 0.5).ceil() as usize
        })
        .sum()
}

/// Drives the agent's event stream, persisting periodically and on every
/// exit path, and yields each forwarded event to the transport in turn.
fn drive_and_persist(
    mut events: impl Stream<Item = AgentEvent> + Unpin + Send + 'static,
    db: Database,
    thread_id: String,
    user_id: String,
    config: Config,
    guard: Arc<RegistrationGuard<dyn StreamRegistry>>,
    cancellation: CancellationToken,
) -> impl Stream<Item = AgentEvent> {
    async_stream::stream! {
        let _guard = guard;
        let mut assistant_message_id: Option<String> = None;
        let mut accumulator = String::new();
        let mut events_since_upsert = 0usize;
        let mut last_upsert = Instant::now();
        let mut stream_id_for_thread = thread_id.clone();

        loop {
            if cancellation.is_cancelled() {
                persist_partial(
                    &db,
                    &thread_id,
                    &user_id,
                    &mut assistant_message_id,
                    &accumulator,
                    json!({ "streamId": stream_id_for_thread, "partial": true, "aborted": true }),
                )
                .await;
                let message_id = assistant_message_id.clone();
                yield AgentEvent::Done {
                    message_id,
                    stream_id: Some(stream_id_for_thread.clone()),
                };
                return;
            }

            let event = tokio::select! {
                biased;
                () = cancellation.cancelled() => continue,
                event = events.next() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match &event {
                AgentEvent::Metadata { stream_id, .. } => {
                    stream_id_for_thread = stream_id.clone();
                }
                AgentEvent::AgentUpdated { .. } => {
                    if assistant_message_id.is_none() {
                        assistant_message_id = Some(Uuid::now_v7().to_string());
                    }
                }
                AgentEvent::Data { answer } => {
                    accumulator.push_str(answer);
                    events_since_upsert += 1;
                    if events_since_upsert >= config.partial_upsert_every_n_events
                        || last_upsert.elapsed() >= config.partial_upsert_every
                    {
                        persist_partial(
                            &db,
                            &thread_id,
                            &user_id,
                            &mut assistant_message_id,
                            &accumulator,
                            json!({ "streamId": stream_id_for_thread, "partial": true }),
                        )
                        .await;
                        events_since_upsert = 0;
                        last_upsert = Instant::now();
                    }
                }
                AgentEvent::Error { error, code } => {
                    persist_partial(
                        &db,
                        &thread_id,
                        &user_id,
                        &mut assistant_message_id,
                        &accumulator,
                        json!({ "streamId": stream_id_for_thread, "error": error, "errorCode": code }),
                    )
                    .await;
                    yield event;
                    return;
                }
                AgentEvent::Done { .. } => {
                    persist_partial(
                        &db,
                        &thread_id,
                        &user_id,
                        &mut assistant_message_id,
                        &accumulator,
                        json!({ "streamId": stream_id_for_thread, "partial": false }),
                    )
                    .await;
                    let message_id = assistant_message_id.clone();
                    yield AgentEvent::Done {
                        message_id,
                        stream_id: Some(stream_id_for_thread.clone()),
                    };
                    return;
                }
            }
            yield event;
        }
    }
}

async fn persist_partial(
    db: &Database,
    thread_id: &str,
    user_id: &str,
    assistant_message_id: &mut Option<String>,
    content: &str,
    metadata: serde_json::Value,
) {
    let id = assistant_message_id
        .get_or_insert_with(|| Uuid::now_v7().to_string())
        .clone();
    if let Err(e) = db
        .upsert_message(
            id,
            thread_id.to_string(),
            user_id.to_string(),
            Role::Assistant,
            content.to_string(),
            metadata,
            IfMatch::Any,
        )
        .await
    {
        warn!(error = %e, thread_id, "failed to persist partial assistant message");
    }
}

impl Coordinator {
    /// Invoked by the `/chat/stop` handler: best-effort, idempotent.
    pub async fn stop(&self, thread_id: &str) {
        info!(thread_id, "stop requested");
        self.registry.signal(thread_id).await;
    }
}

fn log_request_start(trace_id: &str, thread_id: &str, user_id: &str) {
    info!(trace_id, thread_id, user_id, timestamp = %Utc::now(), "chat stream starting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::{MockEmbeddingsProvider, MockLlmProvider, MockRetrievalProvider};
    use crate::registry::LocalRegistry;

    fn msg(role: Role, content: &str) -> InboundMessage {
        InboundMessage {
            id: None,
            role,
            content: content.to_string(),
            metadata: json!({}),
        }
    }

    #[test]
    fn infer_title_collapses_and_truncates() {
        let long = "a".repeat(100);
        let title = infer_title(&format!("  hello   world  {long}"));
        assert_eq!(title.len(), 80);
        assert!(title.starts_with("hello world"));
    }

    #[test]
    fn prepare_history_keeps_system_messages() {
        let messages = vec![
            msg(Role::System, "be nice"),
            msg(Role::User, "hi"),
            msg(Role::Assistant, "hello"),
        ];
        let history = prepare_history(&messages, 30, 8000);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "be nice");
    }

    #[tokio::test]
    async fn process_chat_creates_thread_and_streams_to_done() {
        let db = Database::open_in_memory().unwrap();
        let registry: Arc<dyn crate::registry::StreamRegistry> =
            LocalRegistry::new(std::time::Duration::from_secs(3600));
        let coordinator = Coordinator::new(
            db.clone(),
            registry,
            Arc::new(MockLlmProvider::scripted(["Hello", " there"])),
            Arc::new(MockEmbeddingsProvider { dimension: 4 }),
            Arc::new(MockRetrievalProvider { passages: vec![] }),
            Config::from_env(),
        );

        let request = ChatRequest {
            thread_id: None,
            user_id: "u1".into(),
            agent_type: "normal".into(),
            messages: vec![msg(Role::User, "Hello")],
            system_prompt: None,
        };

        let stream = coordinator
            .process_chat(request, CancellationToken::new())
            .await
            .unwrap();
        tokio::pin!(stream);

        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            if matches!(event, AgentEvent::Done { .. }) {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }
}
