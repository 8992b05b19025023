//! HTTP integration tests for the Fede REST API.
//!
//! Drive the axum router with `oneshot` against an in-memory engine with
//! deterministic embedding and completion providers.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fede_server::http::{build_router, health_inner, USER_ID_HEADER};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use common::memory_state;

async fn call(
    app: &axum::Router,
    method: &str,
    uri: &str,
    user: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user.to_string());
    }
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn ingest_contacto(app: &axum::Router) -> String {
    let (status, body) = call(
        app,
        "POST",
        "/knowledge",
        None,
        Some(json!({
            "title": "Contacto cero",
            "content": "El contacto cero dura al menos 30 días.",
            "contentType": "methodology",
            "category": "paso_1_contacto_cero",
            "tags": ["contacto"],
            "priority": 9
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "ingest failed: {:?}", body);
    assert_eq!(body["embedded"], true);
    body["item"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_version_endpoint() {
    let app = build_router(memory_state());
    let (status, body) = call(&app, "GET", "/version", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_health_reports_memory_backend() {
    let state = memory_state();
    let (status, body) = health_inner(&state).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
    assert!(body.get("postgresql").is_none());
}

#[tokio::test]
async fn test_config_hides_database_url() {
    let app = build_router(memory_state());
    let (status, body) = call(&app, "GET", "/config", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retrieval"]["top_k"], 5);
    assert!(body["database"].get("url").is_none());
}

#[tokio::test]
async fn test_chat_requires_caller() {
    let app = build_router(memory_state());
    let (status, body) = call(&app, "POST", "/chat", None, Some(json!({"message": "hola"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_chat_validates_message() {
    let app = build_router(memory_state());
    let user = Some(Uuid::new_v4());

    let (status, body) = call(&app, "POST", "/chat", user, Some(json!({"message": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, _) = call(&app, "POST", "/chat", user, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let long = "a".repeat(1001);
    let (status, _) = call(&app, "POST", "/chat", user, Some(json!({"message": long}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_answers_with_sources_and_records_turn() {
    let app = build_router(memory_state());
    ingest_contacto(&app).await;
    let user = Uuid::new_v4();

    let (status, body) = call(
        &app,
        "POST",
        "/chat",
        Some(user),
        Some(json!({"message": "¿Cuánto dura el contacto cero?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Fede dice: ¿Cuánto dura el contacto cero?");
    assert_eq!(body["sources"][0]["title"], "Contacto cero");
    assert_eq!(body["sources"][0]["category"], "paso_1_contacto_cero");
    assert!(body["processingTime"].is_number());
    assert!(body.get("isOutOfScope").is_none());

    let session = body["sessionId"].as_str().unwrap().to_string();
    let (status, history) = call(
        &app,
        "GET",
        &format!("/chat/history?sessionId={}", session),
        Some(user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["count"], 1);
    assert_eq!(history["conversations"][0]["outcome"], "answered");
}

#[tokio::test]
async fn test_off_topic_chat_is_declined_but_successful() {
    let app = build_router(memory_state());
    let (status, body) = call(
        &app,
        "POST",
        "/chat",
        Some(Uuid::new_v4()),
        Some(json!({"message": "¿Cuál es la capital de Francia?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["isOutOfScope"], true);
    assert!(body.get("sources").is_none());
}

#[tokio::test]
async fn test_rating_is_owner_scoped() {
    let app = build_router(memory_state());
    let owner = Uuid::new_v4();
    let (_, body) = call(&app, "POST", "/chat", Some(owner), Some(json!({"message": "Mi ex me bloqueó"}))).await;
    let turn = body["conversationId"].as_str().unwrap().to_string();
    let uri = format!("/chat/{}/rate", turn);

    let (status, _) = call(&app, "POST", &uri, Some(Uuid::new_v4()), Some(json!({"rating": 5}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "POST", &uri, Some(owner), Some(json!({"rating": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "POST",
        &uri,
        Some(owner),
        Some(json!({"rating": 4, "feedback": "Me ayudó"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let session = {
        let (_, h) = call(&app, "GET", "/chat/history", Some(owner), None).await;
        h["conversations"][0]["sessionId"].as_str().unwrap().to_string()
    };
    let (status, stats) = call(&app, "GET", &format!("/sessions/{}/stats", session), Some(owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalMessages"], 1);
    assert_eq!(stats["avgRating"], 4.0);
}

#[tokio::test]
async fn test_new_session_returns_id() {
    let app = build_router(memory_state());
    let (status, body) = call(&app, "POST", "/sessions", Some(Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(Uuid::parse_str(body["sessionId"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_knowledge_lifecycle() {
    let app = build_router(memory_state());
    let id = ingest_contacto(&app).await;

    let (status, list) = call(&app, "GET", "/knowledge?category=paso_1_contacto_cero", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["hasEmbedding"], true);

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/knowledge/{}", id),
        None,
        Some(json!({"priority": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["item"]["priority"], 3);

    let (status, body) = call(&app, "GET", &format!("/knowledge/{}", id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Contacto cero");
    assert!(body.get("embedding").is_none());

    let (status, _) = call(&app, "DELETE", &format!("/knowledge/{}", id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, list) = call(&app, "GET", "/knowledge?active=true", None, None).await;
    assert!(list.as_array().unwrap().is_empty());

    let (status, _) = call(&app, "GET", &format!("/knowledge/{}", Uuid::new_v4()), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ingest_rejects_bad_payload() {
    let app = build_router(memory_state());
    let (status, body) = call(&app, "POST", "/knowledge", None, Some(json!({"title": "Sin contenido"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, _) = call(
        &app,
        "POST",
        "/knowledge",
        None,
        Some(json!({"title": "T", "content": "C", "priority": 42})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reembed_with_nothing_pending() {
    let app = build_router(memory_state());
    ingest_contacto(&app).await;
    let (status, body) = call(&app, "POST", "/knowledge/reembed", None, Some(json!({"limit": 10}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 0);
}

#[tokio::test]
async fn test_footer_crud_and_selection() {
    let app = build_router(memory_state());

    let (status, _) = call(&app, "POST", "/footers/select", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, footer) = call(
        &app,
        "POST",
        "/footers",
        None,
        Some(json!({
            "type": "app_descarga",
            "name": "App",
            "template": "💡 {frase}\n📱 {app_ios}",
            "urls": {"app_ios": "https://apps.example/ios"},
            "probability": 30
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{:?}", footer);
    let id = footer["id"].as_str().unwrap().to_string();

    let (status, selection) = call(
        &app,
        "POST",
        "/footers/select",
        None,
        Some(json!({"keyPhrase": "Soltá lo que no controlás"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(selection["text"], "💡 Soltá lo que no controlás\n📱 https://apps.example/ios");
    assert_eq!(selection["footer"]["usageCount"], 1);

    let (_, active) = call(&app, "GET", "/footers/active", None, None).await;
    assert_eq!(active["totalProbability"], 30);
    assert_eq!(active["byType"][0]["type"], "app_descarga");

    let (status, updated) = call(
        &app,
        "PUT",
        &format!("/footers/{}", id),
        None,
        Some(json!({"probability": 150})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{:?}", updated);

    let (status, _) = call(
        &app,
        "PUT",
        &format!("/footers/{}", id),
        None,
        Some(json!({"isActive": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, stats) = call(&app, "GET", "/footers/stats", None, None).await;
    assert_eq!(stats["totalUsage"], 1);
    assert_eq!(stats["inactiveCount"], 1);

    let (status, _) = call(&app, "DELETE", &format!("/footers/{}", id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", &format!("/footers/{}", id), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_footer_selection_without_phrase_drops_placeholder() {
    let app = build_router(memory_state());
    let (status, _) = call(
        &app,
        "POST",
        "/footers",
        None,
        Some(json!({
            "type": "app_descarga",
            "name": "App",
            "template": "💡 {frase}\n📱 {app_ios}",
            "urls": {"app_ios": "https://apps.example/ios"},
            "probability": 30
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, selection) = call(&app, "POST", "/footers/select", None, None).await;
    assert_eq!(status, StatusCode::OK, "{:?}", selection);
    assert_eq!(selection["text"], "📱 https://apps.example/ios");
}
