//! Shared error taxonomy for the chat streaming core.
//!
//! One `thiserror`-derived enum, crossing component boundaries, matching how
//! `db::DbError` and `llm::LlmError` are each a single enum per concern in the
//! teacher's codebase.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("upstream failure: {0}")]
    UpstreamFatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Invalid(_) => "INVALID_REQUEST",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::Conflict(_) => "CONFLICT",
            ChatError::Transient(_) => "UPSTREAM_UNAVAILABLE",
            ChatError::UpstreamFatal(_) => "AGENT_ERROR",
            ChatError::Cancelled => "CANCELLED",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Invalid(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::Conflict(_) => StatusCode::PRECONDITION_FAILED,
            ChatError::Transient(_) => StatusCode::TOO_MANY_REQUESTS,
            ChatError::UpstreamFatal(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Cancelled => StatusCode::OK,
        }
    }

    /// True when a caller following this crate's retry policy should retry the
    /// call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Transient(_))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "statusCode")]
    status_code: u16,
    message: String,
    error: &'static str,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            status_code: status.as_u16(),
            message: self.to_string(),
            error: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

impl From<crate::db::DbError> for ChatError {
    fn from(err: crate::db::DbError) -> Self {
        match err {
            crate::db::DbError::NotFound(msg) => ChatError::NotFound(msg),
            crate::db::DbError::Conflict(msg) => ChatError::Conflict(msg),
            crate::db::DbError::Invalid(msg) => ChatError::Invalid(msg),
            crate::db::DbError::Sqlite(e) => ChatError::Transient(e.to_string()),
            crate::db::DbError::Transient(msg) => ChatError::Transient(msg),
            crate::db::DbError::Join(e) => ChatError::Transient(e.to_string()),
        }
    }
}

impl From<crate::agents::providers::LlmError> for ChatError {
    fn from(err: crate::agents::providers::LlmError) -> Self {
        use crate::agents::providers::LlmErrorKind;
        match err.kind {
            LlmErrorKind::Network | LlmErrorKind::RateLimit | LlmErrorKind::ServerError => {
                ChatError::Transient(err.message)
            }
            LlmErrorKind::Auth | LlmErrorKind::InvalidRequest | LlmErrorKind::Unknown => {
                ChatError::UpstreamFatal(err.message)
            }
        }
    }
}
