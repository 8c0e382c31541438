//! HTTP surface
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/chat/stream` | Stream one chat turn as Server-Sent Events |
//! | `POST` | `/v1/sessions` | Create a session |
//! | `GET` | `/v1/sessions?user_id&limit&offset` | A user's sessions, newest first |
//! | `GET` | `/v1/sessions/{id}/messages?limit&offset` | Chat history, newest first |
//! | `DELETE` | `/v1/sessions/{id}?user_id` | Delete a session owned by `user_id` |
//! | `DELETE` | `/v1/messages/{id}` | Delete one message |
//! | `GET` | `/health` | Liveness |
//! | `GET` | `/metrics` | Prometheus text format |
//!
//! User identity arrives already verified by the upstream edge gateway.

use crate::error::{ApiError, ApiResult};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures::{Stream, StreamExt};
use palaver_foundation::metrics::ChatMetrics;
use palaver_foundation::orchestrator::ChatOrchestrator;
use palaver_kernel::chat::{ChatEvent, ChatRequest};
use palaver_kernel::conversation::{Message, Session};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const DEFAULT_PAGE_SIZE: usize = 20;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub metrics: Option<Arc<ChatMetrics>>,
    pub max_page_size: usize,
}

impl AppState {
    fn page(&self, query: &PageQuery) -> (usize, usize) {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, self.max_page_size.max(1));
        (limit, query.offset.unwrap_or(0))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/stream", post(stream_chat))
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/{id}", delete(delete_session))
        .route("/v1/sessions/{id}/messages", get(chat_history))
        .route("/v1/messages/{id}", delete(delete_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UserPageQuery {
    #[serde(default)]
    pub user_id: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub user_id: String,
    #[serde(default)]
    pub title: String,
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "palaver" }))
}

/// `GET /metrics`
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(metrics) => (StatusCode::OK, metrics.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

fn to_sse(event: ChatEvent) -> Event {
    let frame = if event.is_error() {
        Event::default().event("error")
    } else {
        Event::default()
    };
    frame.json_data(&event).unwrap_or_else(|e| {
        Event::default()
            .event("error")
            .data(json!({ "session_id": event.session_id, "error": e.to_string() }).to_string())
    })
}

/// `POST /v1/chat/stream`
///
/// Failures before the first token answer with a JSON error body. After
/// that, a failure is the last SSE frame (`event: error`). Closing the
/// connection cancels the backend stream.
async fn stream_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let cancel = CancellationToken::new();
    let rx = state.orchestrator.stream_chat(request, cancel.clone()).await?;

    let guard = cancel.drop_guard();
    let frames = ReceiverStream::new(rx).map(move |event| {
        let _alive = &guard;
        Ok::<_, Infallible>(to_sse(event))
    });
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

/// `POST /v1/sessions`
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state
        .orchestrator
        .create_session(&body.user_id, &body.title)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /v1/sessions`
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<UserPageQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    let (limit, offset) = state.page(&PageQuery {
        limit: query.limit,
        offset: query.offset,
    });
    let sessions = state
        .orchestrator
        .get_user_sessions(&query.user_id, limit, offset)
        .await?;
    Ok(Json(sessions))
}

/// `GET /v1/sessions/{id}/messages`
async fn chat_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let (limit, offset) = state.page(&query);
    let messages = state.orchestrator.get_chat_history(&id, limit, offset).await?;
    Ok(Json(messages))
}

/// `DELETE /v1/sessions/{id}`
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_session(&id, &owner.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/messages/{id}`
async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_message(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
