use fede_core::ipc::{FedeRequest, FedeResponse};
use fede_core::models::NewKnowledge;
use fede_core::{db, ChatRequest, FedeError, FedeResult};
use serde::Serialize;

use crate::state::AppState;

/// Dispatch one request. Shared by the IPC socket and the HTTP handlers for
/// chat, ingestion and footer selection.
pub async fn handle_request(request: FedeRequest, state: &AppState) -> FedeResponse {
    match request {
        FedeRequest::Ping => FedeResponse::pong(),
        FedeRequest::Health => respond(health_report(state).await),
        FedeRequest::Chat {
            user_id,
            session_id,
            message,
            category,
        } => {
            let request = ChatRequest {
                user_id,
                session_id,
                message,
                category,
            };
            respond(state.engine.chat(request).await)
        }
        FedeRequest::SelectFooter { key_phrase } => {
            let selection = state
                .engine
                .footers()
                .select_rendered(key_phrase.as_deref())
                .await
                .and_then(|s| s.ok_or_else(|| FedeError::not_found("active footer template")));
            respond(selection)
        }
        FedeRequest::Ingest { payload } => {
            let input = match serde_json::from_value::<NewKnowledge>(payload) {
                Ok(input) => input,
                Err(e) => return FedeResponse::err("invalid_input", format!("Invalid knowledge payload: {}", e)),
            };
            respond(state.engine.knowledge().ingest(input).await)
        }
    }
}

/// Engine health plus database versions when backed by Postgres.
pub async fn health_report(state: &AppState) -> FedeResult<serde_json::Value> {
    let mut report = state.engine.health().await?;

    if let Some(pool) = &state.pool {
        let pg_ver = db::health_check(pool).await?;
        let vec_ver = db::check_pgvector(pool).await?;
        if let Some(obj) = report.as_object_mut() {
            obj.insert("postgresql".to_string(), serde_json::json!(pg_ver));
            obj.insert("pgvector".to_string(), serde_json::json!(vec_ver));
        }
    }

    if let Some(obj) = report.as_object_mut() {
        obj.insert("status".to_string(), serde_json::json!("healthy"));
        obj.insert("version".to_string(), serde_json::json!(env!("CARGO_PKG_VERSION")));
    }
    Ok(report)
}

fn respond<T: Serialize>(result: FedeResult<T>) -> FedeResponse {
    match result.and_then(|v| serde_json::to_value(v).map_err(|e| FedeError::Internal(e.to_string()))) {
        Ok(data) => FedeResponse::ok(data),
        Err(e) => {
            if e.code() == "storage" || e.code() == "internal" {
                tracing::error!(error = %e, "Request failed");
            }
            FedeResponse::from_error(&e)
        }
    }
}
