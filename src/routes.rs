// src/routes.rs

use axum::{
    Extension, Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::IntoResponse,
    routing::{get, post, put},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    error::{ChatError, ChatResult},
    models::{Message, UnreadSummary},
    state::ChatState,
    websocket::websocket_handler,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Handle of the process-wide Prometheus recorder, installed on first use.
///
/// If another recorder is already installed the handle renders an empty
/// registry instead of failing startup.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "failed to install Prometheus recorder");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Header carrying the user id established by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller of an HTTP request.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| CurrentUser(value.to_string()))
            .ok_or_else(|| ChatError::Validation(format!("missing {USER_ID_HEADER} header")))
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

/// Builds the application router.
pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/ws/chat", get(websocket_handler))
        .route("/health", get(health))
        .route("/api/v1/chats/unread", get(unread_summary))
        .route("/api/v1/chats/online-users", get(online_users))
        .route("/api/v1/chats/{chat_id}/messages", post(send_message))
        .route("/api/v1/chats/{chat_id}/read", put(mark_read))
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ChatState>) -> impl IntoResponse {
    let report = state.chat.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn send_message(
    State(state): State<ChatState>,
    CurrentUser(user_id): CurrentUser,
    Path(chat_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> ChatResult<(StatusCode, Json<Message>)> {
    let message = state
        .chat
        .send_chat_frame(&user_id, &chat_id, &body.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<ChatState>,
    CurrentUser(user_id): CurrentUser,
    Path(chat_id): Path<String>,
) -> ChatResult<StatusCode> {
    state.chat.mark_read(&user_id, &chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unread_summary(
    State(state): State<ChatState>,
    CurrentUser(user_id): CurrentUser,
) -> ChatResult<Json<UnreadSummary>> {
    Ok(Json(state.chat.get_unread_summary(&user_id).await?))
}

async fn online_users(State(state): State<ChatState>) -> ChatResult<impl IntoResponse> {
    let users = state.chat.get_online_users().await?;
    Ok(Json(json!({
        "count": users.len(),
        "users": users,
    })))
}
