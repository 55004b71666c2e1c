//! Management surface — CRUD over service definitions, lifecycle actions
//! (start/stop/restart), log retrieval/streaming, API key issuance, and
//! read-only settings/metrics/health endpoints.

pub mod auth;

use crate::error::AppError;
use crate::registry::{CreateServiceRequest, UpdateServiceRequest};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let protected = Router::new()
        .route("/services", get(list_services).post(create_service))
        .route(
            "/services/{id}",
            get(get_service).patch(update_service).delete(delete_service),
        )
        .route("/services/{id}/start", post(start_service))
        .route("/services/{id}/stop", post(stop_service))
        .route("/services/{id}/restart", post(restart_service))
        .route("/services/{id}/logs", get(service_logs))
        .route("/services/{id}/logs/stream", get(stream_service_logs))
        .route("/api-keys", post(issue_api_key))
        .route("/api-keys/{id}", delete(revoke_api_key))
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_key));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = state.process_manager.service_counts().await;
    Json(json!({ "status": "healthy", "services": counts }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render_prometheus()
}

async fn list_services(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let services = state.registry.list_services().await.map_err(AppError::internal)?;
    Ok(Json(json!({ "services": services })))
}

async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<CreateServiceRequest>,
) -> Result<Json<Value>, AppError> {
    if req.rate_limit == 0 {
        req.rate_limit = state.config.default_rate_limit;
    }
    if req.timeout_ms == 0 {
        req.timeout_ms = state.config.default_timeout_ms;
    }
    let definition = state
        .registry
        .create_service(req)
        .await
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    state.process_manager.add(definition.clone()).await?;
    Ok(Json(serde_json::to_value(definition).unwrap_or(Value::Null)))
}

async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let definition = state.registry.get_service(&id).await.map_err(|_| AppError::NotFound)?;
    let status = match state.process_manager.get(&id).await {
        Some(supervisor) => json!({
            "state": supervisor.state().await.as_str(),
            "restartCount": supervisor.restart_count(),
            "lastError": supervisor.last_error().await,
        }),
        None => json!({ "state": "stopped", "restartCount": 0, "lastError": null }),
    };
    Ok(Json(json!({ "definition": definition, "status": status })))
}

async fn update_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateServiceRequest>,
) -> Result<Json<Value>, AppError> {
    let updated = state
        .registry
        .update_service(&id, req)
        .await
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    // `replace`, not `add`: a live supervisor (and its child process) may
    // already be registered under this id, and must be stopped before the
    // map forgets about it rather than orphaned.
    state.process_manager.replace(updated.clone()).await;
    Ok(Json(serde_json::to_value(updated).unwrap_or(Value::Null)))
}

async fn delete_service(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    state.process_manager.remove(&id).await;
    state.registry.delete_service(&id).await.map_err(AppError::internal)?;
    Ok(Json(json!({ "deleted": true })))
}

async fn start_service(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    state.process_manager.start(&id).await?;
    Ok(Json(json!({ "status": "starting" })))
}

async fn stop_service(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    state.process_manager.stop(&id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn restart_service(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    state.process_manager.restart(&id).await?;
    Ok(Json(json!({ "status": "restarting" })))
}

#[derive(Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn service_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<LogQuery>,
) -> Result<Json<Value>, AppError> {
    let supervisor = state.process_manager.get(&id).await.ok_or(AppError::NotFound)?;
    let logs = supervisor.recent_logs(query.limit.unwrap_or(100)).await;
    Ok(Json(json!({ "logs": logs })))
}

/// `/api/services/{id}/logs/stream` — a WebSocket push of `{timestamp,
/// level, message}` log lines, not SSE: the client never sends anything
/// on this socket, but spec.md classifies it as a WebSocket endpoint
/// alongside the proxy's bidirectional streams, so it upgrades the same way.
async fn stream_service_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let supervisor = state.process_manager.get(&id).await.ok_or(AppError::NotFound)?;
    Ok(ws.on_upgrade(move |socket| push_logs(socket, supervisor)))
}

async fn push_logs(mut socket: WebSocket, supervisor: crate::supervisor::Supervisor) {
    let mut rx = supervisor.subscribe_logs();
    loop {
        match rx.recv().await {
            Ok(line) => {
                let body = serde_json::to_string(&line).unwrap_or_default();
                if socket.send(Message::Text(body.into())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Deserialize)]
struct IssueApiKeyRequest {
    name: String,
}

async fn issue_api_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueApiKeyRequest>,
) -> Result<Json<Value>, AppError> {
    let (id, secret) = state.registry.issue_api_key(&req.name).await.map_err(AppError::internal)?;
    Ok(Json(json!({ "id": id, "key": secret })))
}

async fn revoke_api_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    state.registry.revoke_api_key(&id).await.map_err(AppError::internal)?;
    Ok(Json(json!({ "revoked": true })))
}

