//! API request and response types.
//!
//! Grounded on the teacher's `api/types.rs` (one plain struct per
//! request/response shape, `#[derive(Serialize)]`/`#[derive(Deserialize)]`,
//! `camelCase` wire fields via `#[serde(rename_all)]` where the teacher's own
//! conversation types use it).

use serde::{Deserialize, Serialize};

use crate::db::{Message, Role, Thread};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub thread_id: Option<String>,
    pub messages: Vec<ChatStreamMessage>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub conversation_style: Option<ConversationStyle>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStyle {
    Balanced,
    Creative,
    Precise,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamMessage {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStopRequest {
    pub thread_id: String,
}

#[derive(Debug, Serialize)]
pub struct ChatStopResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListThreadsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPageResponse {
    pub items: Vec<Thread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePageResponse {
    pub items: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchThreadRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_bookmarked: Option<bool>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchThreadResponse {
    pub success: bool,
    pub entity: Thread,
    pub new_etag: String,
    pub session_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub success: bool,
    pub session_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkResponse {
    pub success: bool,
    pub is_bookmarked: bool,
    pub session_token: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
