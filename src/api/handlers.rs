//! HTTP request handlers.
//!
//! Grounded on the teacher's `api/handlers.rs` (`create_router`, `AppError`
//! `IntoResponse` mapping reused wholesale as `ChatError`, idempotency-by-id
//! checks, title-inference style) generalized from conversation/IDE
//! endpoints to thread/message/chat-stream endpoints per SPEC_FULL.md 6.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use super::sse::sse_stream;
use super::types::{
    AgentDescriptor, AgentsResponse, BookmarkResponse, ChatStopRequest, ChatStopResponse,
    ChatStreamRequest, HealthResponse, ListMessagesQuery, ListThreadsQuery, MessagePageResponse,
    PatchThreadRequest, PatchThreadResponse, SuccessResponse, ThreadPageResponse,
};
use super::AppState;
use crate::coordinator::{ChatRequest, InboundMessage};
use crate::db::{IfMatch, Thread};
use crate::error::{ChatError, ChatResult};

const USER_ID_HEADER: &str = "x-user-id";
const IF_MATCH_HEADER: &str = "if-match";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/chat/stream", post(chat_stream))
        .route("/api/v1/chat/stop", post(chat_stop))
        .route("/api/v1/chat/agents", get(list_agents))
        .route("/api/v1/chat/threads", get(list_threads))
        .route("/api/v1/chat/threads/:id", get(get_thread))
        .route("/api/v1/chat/threads/:id", patch(patch_thread))
        .route("/api/v1/chat/threads/:id", delete(soft_delete_thread))
        .route("/api/v1/chat/threads/:id/restore", post(restore_thread))
        .route(
            "/api/v1/chat/threads/:id/permanent",
            delete(hard_delete_thread),
        )
        .route("/api/v1/chat/threads/:id/messages", get(list_messages))
        .route("/api/v1/chat/threads/:id/bookmark", post(bookmark_thread))
        .route("/healthz", get(healthz))
        .with_state(state)
}

fn user_id(headers: &HeaderMap) -> ChatResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ChatError::Invalid("missing X-User-Id header".to_string()))
}

fn if_match(headers: &HeaderMap) -> IfMatch {
    headers
        .get(IF_MATCH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| IfMatch::Tag(s.trim_matches('"').to_string()))
        .unwrap_or(IfMatch::Any)
}

async fn require_owned_thread(state: &AppState, id: &str, user_id: &str) -> ChatResult<Thread> {
    let thread = state
        .db
        .get_thread(id.to_string())
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("thread {id}")))?;
    if thread.user_id != user_id {
        return Err(ChatError::Forbidden(format!("thread {id} is not owned by this user")));
    }
    Ok(thread)
}

async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatStreamRequest>,
) -> ChatResult<impl axum::response::IntoResponse> {
    let user_id = user_id(&headers)?;

    let messages = body
        .messages
        .into_iter()
        .map(|m| InboundMessage {
            id: m.id,
            role: m.role,
            content: m.content,
            metadata: m.metadata.unwrap_or(serde_json::Value::Null),
        })
        .collect();

    let request = ChatRequest {
        thread_id: body.thread_id,
        user_id,
        agent_type: body.agent_type.unwrap_or_else(|| "normal".to_string()),
        messages,
        system_prompt: body.system_prompt,
    };

    let transport_cancellation = CancellationToken::new();
    let events = state
        .coordinator
        .process_chat(request, transport_cancellation.clone())
        .await?;
    let events = super::sse::cancel_on_drop(events, transport_cancellation);

    // `Sse` sets `Content-Type` itself; these three keep every intermediary
    // (reverse proxies in particular) from buffering the stream.
    let mut headers = HeaderMap::new();
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

    Ok((headers, sse_stream(events)))
}

async fn chat_stop(
    State(state): State<AppState>,
    Json(body): Json<ChatStopRequest>,
) -> Json<ChatStopResponse> {
    state.coordinator.stop(&body.thread_id).await;
    Json(ChatStopResponse { success: true })
}

async fn list_agents() -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: vec![
            AgentDescriptor {
                id: "normal".to_string(),
                name: "Normal".to_string(),
                description: "Direct LLM streaming with no retrieval.".to_string(),
            },
            AgentDescriptor {
                id: "rag".to_string(),
                name: "Retrieval-augmented".to_string(),
                description: "Retrieves relevant passages before answering.".to_string(),
            },
            AgentDescriptor {
                id: "multi-agent".to_string(),
                name: "Orchestrator".to_string(),
                description: "Sequences a planner, optional researcher, and writer.".to_string(),
            },
        ],
    })
}

async fn list_threads(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListThreadsQuery>,
) -> ChatResult<Json<ThreadPageResponse>> {
    let user_id = user_id(&headers)?;
    let limit = query.limit.unwrap_or(20);
    let page = state
        .db
        .list_threads(user_id, limit, query.continuation_token, query.include_deleted)
        .await?;
    Ok(Json(ThreadPageResponse {
        items: page.items,
        continuation_token: page.continuation_token,
        has_more: page.has_more,
    }))
}

async fn get_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChatResult<Json<Thread>> {
    let user_id = user_id(&headers)?;
    let thread = require_owned_thread(&state, &id, &user_id).await?;
    Ok(Json(thread))
}

async fn patch_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PatchThreadRequest>,
) -> ChatResult<Json<PatchThreadResponse>> {
    let user_id = user_id(&headers)?;
    require_owned_thread(&state, &id, &user_id).await?;

    let precondition = if_match(&headers);
    let updated = state
        .db
        .update_thread(id, precondition, true, move |t| {
            if let Some(title) = &body.title {
                t.title = Some(title.clone());
            }
            if let Some(bookmarked) = body.is_bookmarked {
                t.is_bookmarked = bookmarked;
            }
            if let Some(metadata) = &body.metadata {
                t.metadata = metadata.clone();
            }
        })
        .await?;

    Ok(Json(PatchThreadResponse {
        success: true,
        new_etag: updated.value.etag.clone(),
        entity: updated.value,
        session_token: updated.session_token,
    }))
}

async fn soft_delete_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChatResult<Json<SuccessResponse>> {
    let user_id = user_id(&headers)?;
    require_owned_thread(&state, &id, &user_id).await?;
    let written = state.db.soft_delete_thread(id, if_match(&headers)).await?;
    Ok(Json(SuccessResponse {
        success: true,
        session_token: written.session_token,
    }))
}

async fn restore_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChatResult<Json<SuccessResponse>> {
    let user_id = user_id(&headers)?;
    require_owned_thread(&state, &id, &user_id).await?;
    let written = state.db.restore_thread(id).await?;
    Ok(Json(SuccessResponse {
        success: true,
        session_token: written.session_token,
    }))
}

async fn hard_delete_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChatResult<Json<SuccessResponse>> {
    let user_id = user_id(&headers)?;
    require_owned_thread(&state, &id, &user_id).await?;
    let written = state.db.hard_delete_thread(id).await?;
    Ok(Json(SuccessResponse {
        success: true,
        session_token: written.session_token,
    }))
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> ChatResult<Json<MessagePageResponse>> {
    let user_id = user_id(&headers)?;
    require_owned_thread(&state, &id, &user_id).await?;
    let limit = query.limit.unwrap_or(50);
    let page = state.db.list_messages(id, limit, query.continuation_token).await?;
    Ok(Json(MessagePageResponse {
        items: page.items,
        continuation_token: page.continuation_token,
        has_more: page.has_more,
    }))
}

async fn bookmark_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChatResult<Json<BookmarkResponse>> {
    let user_id = user_id(&headers)?;
    let thread = require_owned_thread(&state, &id, &user_id).await?;
    let toggled = !thread.is_bookmarked;
    let updated = state
        .db
        .update_thread(id, IfMatch::Any, true, move |t| {
            t.is_bookmarked = toggled;
        })
        .await?;
    Ok(Json(BookmarkResponse {
        success: true,
        is_bookmarked: updated.value.is_bookmarked,
        session_token: updated.session_token,
    }))
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
