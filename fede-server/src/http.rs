//! Fede HTTP REST API
//!
//! Axum server exposing chat, knowledge management and footer selection.
//! Each endpoint is a thin axum handler over an inner function returning
//! `(StatusCode, body)`, so the logic is testable without router dispatch.
//!
//! User-scoped routes read the caller from the `x-user-id` header, which the
//! upstream auth layer sets after verifying the request.
//!
//! Endpoints:
//! - POST   /chat                   chat turn
//! - POST   /chat/:id/rate          rate a recorded turn
//! - GET    /chat/history           caller's turns, oldest first
//! - POST   /sessions               new session id
//! - GET    /sessions/:id/stats     per-session aggregates
//! - POST   /knowledge              ingest (embeds synchronously)
//! - GET    /knowledge              list
//! - GET    /knowledge/:id          fetch
//! - PUT    /knowledge/:id          edit
//! - DELETE /knowledge/:id          soft-disable
//! - POST   /knowledge/reembed      embed items still missing a vector
//! - GET    /footers                list
//! - POST   /footers                create
//! - GET    /footers/active         selection pool grouped by type
//! - GET    /footers/stats          usage stats
//! - POST   /footers/select         select and render one footer
//! - GET    /footers/:id            fetch
//! - PUT    /footers/:id            edit
//! - DELETE /footers/:id            delete
//! - GET    /health, /version, /config

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fede_core::ingest::MAX_REEMBED_BATCH;
use fede_core::ipc::{FedeRequest, FedeResponse};
use fede_core::models::{Category, FooterPatch, KnowledgePatch, NewFooter};
use fede_core::recorder::MAX_HISTORY_LIMIT;
use fede_core::store::ListFilter;
use fede_core::{FedeError, FedeResult};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

type HttpReply = (StatusCode, serde_json::Value);

/// Build the Axum router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/config", get(config_handler))
        .route("/chat", post(chat_handler))
        .route("/chat/history", get(history_handler))
        .route("/chat/:id/rate", post(rate_handler))
        .route("/sessions", post(new_session_handler))
        .route("/sessions/:id/stats", get(session_stats_handler))
        .route("/knowledge", get(list_knowledge_handler).post(ingest_handler))
        .route("/knowledge/reembed", post(reembed_handler))
        .route(
            "/knowledge/:id",
            get(get_knowledge_handler)
                .put(update_knowledge_handler)
                .delete(delete_knowledge_handler),
        )
        .route("/footers", get(list_footers_handler).post(create_footer_handler))
        .route("/footers/active", get(active_footers_handler))
        .route("/footers/stats", get(footer_stats_handler))
        .route("/footers/select", post(select_footer_handler))
        .route(
            "/footers/:id",
            get(get_footer_handler)
                .put(update_footer_handler)
                .delete(delete_footer_handler),
        )
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = format!("{}:{}", state.config().http.host, state.config().http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Fede HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: Option<String>,
    pub session_id: Option<Uuid>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RateBody {
    pub rating: i16,
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub session_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct KnowledgeQuery {
    pub category: Option<String>,
    pub active: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReembedBody {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelectFooterBody {
    pub key_phrase: Option<String>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(code: &str, msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
            code: code.to_string(),
        }
    }

    fn into_reply(self, status: StatusCode) -> HttpReply {
        let body = serde_json::to_value(&self).unwrap_or_else(|_| serde_json::json!({"status": "error"}));
        (status, body)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// HTTP status for a machine error code.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "invalid_input" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "not_found" => StatusCode::NOT_FOUND,
        "embedding_unavailable" | "completion" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert an IPC `FedeResponse` into an HTTP reply.
pub fn response_to_http(response: FedeResponse) -> HttpReply {
    if response.is_ok() {
        return (StatusCode::OK, response.data.unwrap_or(serde_json::json!({})));
    }
    let code = response.code.unwrap_or_else(|| "internal".to_string());
    let status = status_for_code(&code);
    ErrorResponse::new(&code, response.error.unwrap_or_else(|| "unknown error".to_string())).into_reply(status)
}

fn reply<T: Serialize>(result: FedeResult<T>) -> HttpReply {
    match result.and_then(|v| serde_json::to_value(v).map_err(|e| FedeError::Internal(e.to_string()))) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => error_reply(&e),
    }
}

fn error_reply(e: &FedeError) -> HttpReply {
    let status = status_for_code(e.code());
    if status.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    }
    ErrorResponse::new(e.code(), e.to_string()).into_reply(status)
}

/// Caller identity from the `x-user-id` header.
pub fn caller(headers: &HeaderMap) -> std::result::Result<Uuid, HttpReply> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| {
            ErrorResponse::new("unauthorized", format!("missing or invalid {} header", USER_ID_HEADER))
                .into_reply(StatusCode::UNAUTHORIZED)
        })
}

fn parse_category(raw: Option<&str>) -> FedeResult<Option<Category>> {
    match raw.map(str::trim) {
        Some(c) if !c.is_empty() => c.parse().map(Some).map_err(FedeError::InvalidInput),
        _ => Ok(None),
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(state: &AppState) -> HttpReply {
    match crate::router::health_report(state).await {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": format!("fede/{}", fede_core::ipc::PROTOCOL_VERSION),
    })
}

pub fn config_inner(state: &AppState) -> HttpReply {
    reply(Ok(state.config()))
}

pub async fn chat_inner(state: &AppState, user_id: Uuid, body: ChatBody) -> HttpReply {
    let message = match body.message {
        Some(m) => m,
        None => return ErrorResponse::new("invalid_input", "message field is required").into_reply(StatusCode::BAD_REQUEST),
    };

    let request = FedeRequest::Chat {
        user_id,
        session_id: body.session_id,
        message,
        category: body.category,
    };
    response_to_http(crate::router::handle_request(request, state).await)
}

pub async fn rate_inner(state: &AppState, user_id: Uuid, id: Uuid, body: RateBody) -> HttpReply {
    let result = state
        .engine
        .recorder()
        .rate(id, user_id, body.rating, body.feedback.as_deref())
        .await
        .map(|_| serde_json::json!({"success": true, "id": id}));
    reply(result)
}

pub async fn history_inner(state: &AppState, user_id: Uuid, query: HistoryQuery) -> HttpReply {
    let limit = query.limit.unwrap_or(50).min(MAX_HISTORY_LIMIT);
    let result = state
        .engine
        .recorder()
        .history(user_id, query.session_id, limit)
        .await
        .map(|turns| serde_json::json!({"count": turns.len(), "conversations": turns}));
    reply(result)
}

pub fn new_session_inner(state: &AppState) -> HttpReply {
    (StatusCode::OK, serde_json::json!({"sessionId": state.engine.new_session()}))
}

pub async fn session_stats_inner(state: &AppState, user_id: Uuid, session_id: Uuid) -> HttpReply {
    reply(state.engine.recorder().session_stats(session_id, user_id).await)
}

pub async fn ingest_inner(state: &AppState, payload: serde_json::Value) -> HttpReply {
    let (status, body) = response_to_http(crate::router::handle_request(FedeRequest::Ingest { payload }, state).await);
    if status == StatusCode::OK {
        return (StatusCode::CREATED, body);
    }
    (status, body)
}

pub async fn list_knowledge_inner(state: &AppState, query: KnowledgeQuery) -> HttpReply {
    let category = match parse_category(query.category.as_deref()) {
        Ok(c) => c,
        Err(e) => return error_reply(&e),
    };
    let filter = ListFilter {
        category,
        active: query.active,
        missing_embedding: false,
        limit: Some(query.limit.unwrap_or(100).min(500)),
        offset: query.offset.unwrap_or(0),
    };
    reply(state.engine.knowledge().list(&filter).await)
}

pub async fn get_knowledge_inner(state: &AppState, id: Uuid) -> HttpReply {
    reply(state.engine.knowledge().get(id).await)
}

pub async fn update_knowledge_inner(state: &AppState, id: Uuid, patch: KnowledgePatch) -> HttpReply {
    reply(state.engine.knowledge().update(id, patch).await)
}

pub async fn delete_knowledge_inner(state: &AppState, id: Uuid) -> HttpReply {
    let result = state
        .engine
        .knowledge()
        .deactivate(id)
        .await
        .map(|_| serde_json::json!({"deactivated": true, "id": id}));
    reply(result)
}

pub async fn reembed_inner(state: &AppState, body: ReembedBody) -> HttpReply {
    let limit = body.limit.unwrap_or(MAX_REEMBED_BATCH);
    reply(state.engine.knowledge().reembed_pending(limit).await)
}

pub async fn list_footers_inner(state: &AppState) -> HttpReply {
    reply(state.engine.footers().list().await)
}

pub async fn create_footer_inner(state: &AppState, input: NewFooter) -> HttpReply {
    match state.engine.footers().create(input).await {
        Ok(footer) => {
            let (_, body) = reply(Ok(footer));
            (StatusCode::CREATED, body)
        }
        Err(e) => error_reply(&e),
    }
}

pub async fn active_footers_inner(state: &AppState) -> HttpReply {
    reply(state.engine.footers().active_pool().await)
}

pub async fn footer_stats_inner(state: &AppState) -> HttpReply {
    reply(state.engine.footers().stats().await)
}

pub async fn select_footer_inner(state: &AppState, body: SelectFooterBody) -> HttpReply {
    let request = FedeRequest::SelectFooter {
        key_phrase: body.key_phrase,
    };
    response_to_http(crate::router::handle_request(request, state).await)
}

pub async fn get_footer_inner(state: &AppState, id: Uuid) -> HttpReply {
    reply(state.engine.footers().get(id).await)
}

pub async fn update_footer_inner(state: &AppState, id: Uuid, patch: FooterPatch) -> HttpReply {
    reply(state.engine.footers().update(id, patch).await)
}

pub async fn delete_footer_inner(state: &AppState, id: Uuid) -> HttpReply {
    let result = state
        .engine
        .footers()
        .delete(id)
        .await
        .map(|_| serde_json::json!({"deleted": true, "id": id}));
    reply(result)
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn config_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = config_inner(&state);
    (status, Json(body))
}

pub async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let (status, body) = match caller(&headers) {
        Ok(user_id) => chat_inner(&state, user_id, body).await,
        Err(r) => r,
    };
    (status, Json(body))
}

pub async fn rate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<RateBody>,
) -> impl IntoResponse {
    let (status, body) = match caller(&headers) {
        Ok(user_id) => rate_inner(&state, user_id, id, body).await,
        Err(r) => r,
    };
    (status, Json(body))
}

pub async fn history_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let (status, body) = match caller(&headers) {
        Ok(user_id) => history_inner(&state, user_id, query).await,
        Err(r) => r,
    };
    (status, Json(body))
}

pub async fn new_session_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let (status, body) = match caller(&headers) {
        Ok(_) => new_session_inner(&state),
        Err(r) => r,
    };
    (status, Json(body))
}

pub async fn session_stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = match caller(&headers) {
        Ok(user_id) => session_stats_inner(&state, user_id, id).await,
        Err(r) => r,
    };
    (status, Json(body))
}

pub async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let (status, body) = ingest_inner(&state, payload).await;
    (status, Json(body))
}

pub async fn list_knowledge_handler(
    State(state): State<AppState>,
    Query(query): Query<KnowledgeQuery>,
) -> impl IntoResponse {
    let (status, body) = list_knowledge_inner(&state, query).await;
    (status, Json(body))
}

pub async fn get_knowledge_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let (status, body) = get_knowledge_inner(&state, id).await;
    (status, Json(body))
}

pub async fn update_knowledge_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<KnowledgePatch>,
) -> impl IntoResponse {
    let (status, body) = update_knowledge_inner(&state, id, patch).await;
    (status, Json(body))
}

pub async fn delete_knowledge_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let (status, body) = delete_knowledge_inner(&state, id).await;
    (status, Json(body))
}

pub async fn reembed_handler(
    State(state): State<AppState>,
    body: Option<Json<ReembedBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let (status, body) = reembed_inner(&state, body).await;
    (status, Json(body))
}

pub async fn list_footers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = list_footers_inner(&state).await;
    (status, Json(body))
}

pub async fn create_footer_handler(
    State(state): State<AppState>,
    Json(input): Json<NewFooter>,
) -> impl IntoResponse {
    let (status, body) = create_footer_inner(&state, input).await;
    (status, Json(body))
}

pub async fn active_footers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = active_footers_inner(&state).await;
    (status, Json(body))
}

pub async fn footer_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = footer_stats_inner(&state).await;
    (status, Json(body))
}

pub async fn select_footer_handler(
    State(state): State<AppState>,
    body: Option<Json<SelectFooterBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let (status, body) = select_footer_inner(&state, body).await;
    (status, Json(body))
}

pub async fn get_footer_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let (status, body) = get_footer_inner(&state, id).await;
    (status, Json(body))
}

pub async fn update_footer_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<FooterPatch>,
) -> impl IntoResponse {
    let (status, body) = update_footer_inner(&state, id, patch).await;
    (status, Json(body))
}

pub async fn delete_footer_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let (status, body) = delete_footer_inner(&state, id).await;
    (status, Json(body))
}
