// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failure taxonomy of the chat subsystem.
///
/// Ingestion errors travel back to the sender synchronously. Delivery, liveness
/// and presence failures are logged by the component that hit them and never
/// reach other users.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Bad input, rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// The user is not a participant of the conversation.
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    Permission {
        user_id: String,
        conversation_id: String,
    },

    /// Durable write or read failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The socket of a connection is broken.
    #[error("transport error: {0}")]
    Transport(String),

    /// Shared key-value store or bus is unreachable.
    #[error("shared backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl ChatError {
    pub fn permission(user_id: &str, conversation_id: &str) -> Self {
        ChatError::Permission {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }

    /// Stable machine-readable code, used in HTTP bodies and `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Permission { .. } => "permission",
            ChatError::Storage(_) => "storage",
            ChatError::Transport(_) => "transport",
            ChatError::BackendUnavailable(_) => "backend_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Permission { .. } => StatusCode::FORBIDDEN,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::Transport(_) => StatusCode::BAD_GATEWAY,
            ChatError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message safe to show to the client. Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Storage(_) => "failed to store message".to_string(),
            ChatError::BackendUnavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(err: redis::RedisError) -> Self {
        ChatError::BackendUnavailable(err.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        let body = Json(json!({
            "code": self.code(),
            "error": self.client_message(),
        }));
        (status, body).into_response()
    }
}
