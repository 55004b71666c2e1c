//! End-to-end tests against the management surface, built the same way
//! `main.rs` builds it, driven with `tower::ServiceExt::oneshot` rather than
//! a bound TCP listener.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use mcpd::config::Config;
use mcpd::registry::Registry;
use mcpd::{management, AppState};
use std::sync::Arc;
use tower::ServiceExt;

async fn test_state(data_dir: &std::path::Path) -> Arc<AppState> {
    let config = Config::new(Some(0), Some(data_dir.to_path_buf()), Some("error".to_string()));
    let registry = Registry::new(data_dir).await.unwrap();
    Arc::new(AppState::new(config, registry))
}

fn router(state: Arc<AppState>) -> axum::Router {
    management::router(state.clone()).with_state(state)
}

#[tokio::test]
async fn health_requires_no_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn service_routes_reject_missing_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/services").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_list_and_delete_service_round_trips_with_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let (_, secret) = state.registry.issue_api_key("test").await.unwrap();
    let app = router(state);

    let body = serde_json::json!({
        "name": "echo",
        "entryPoint": "sh",
        "workingDir": "/tmp",
        "args": ["-c", "cat"],
        "env": {},
        "proxyPath": "/mcp/echo",
        "rateLimit": 50,
        "cacheTtl": 0,
        "timeoutMs": 2000,
        "autoRestart": false,
        "maxRestarts": 0,
        "healthCheckIntervalSecs": 3600,
    });

    let create_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/services")
                .header("x-api-key", &secret)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::OK);

    let list_response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/services")
                .header("x-api-key", &secret)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(list_response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["services"].as_array().unwrap().len(), 1);
}
