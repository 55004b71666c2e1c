//! HTTP POST proxying: parse the JSON-RPC envelope, apply rate limiting and
//! caching, forward to the matched supervisor, and relay its response.

use super::websocket;
use crate::cache::ResponseCache;
use crate::error::AppError;
use crate::rate_limiter::Decision;
use crate::rpc::{self, RpcRequest};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{OriginalUri, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
pub struct UpgradeQuery {
    service: String,
}

/// The fixed `/{upgradePath}?service={id}` route from spec.md §4.6 — resolves
/// the service by its id rather than by proxy-path prefix, and otherwise
/// hands off to the same bridging loop the per-service fallback upgrade uses.
pub async fn fixed_ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UpgradeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(supervisor) = state.process_manager.get(&query.service).await else {
        return AppError::NotFound.into_response();
    };
    if supervisor.state().await != crate::supervisor::ServiceState::Running {
        return AppError::IllegalState {
            status: supervisor.state().await.as_str().to_string(),
            last_error: supervisor.last_error().await,
        }
        .into_response();
    }
    ws.on_upgrade(move |socket| websocket::handle(socket, state, supervisor))
}

/// Derive the caller's identity for rate-limiting, in the preference order
/// the spec requires: a trusted forwarded-for header, then a real-ip header,
/// then the socket's remote address.
fn client_key(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(v) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !v.trim().is_empty() {
            return v.trim().to_string();
        }
    }
    remote.map(|addr| addr.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
    ws: Option<WebSocketUpgrade>,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let Some((service_id, supervisor)) = state.process_manager.find_by_path(path).await else {
        return AppError::NotFound.into_response();
    };
    let def = supervisor.definition().await;

    if method == Method::GET && path == format!("{}/health", def.proxy_path) {
        return service_health_response(&supervisor).await;
    }

    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| websocket::handle(socket, state, supervisor));
    }

    state.metrics.inc_requests_total();

    let key = client_key(&headers, remote.map(|ConnectInfo(addr)| addr));
    let decision = state.rate_limiter.check(&service_id, &key, def.rate_limit).await;
    if !decision.allowed {
        state.metrics.inc_rate_limited_total();
        return rate_limit_headers(AppError::RateLimited { retry_after_secs: decision.retry_after_secs }.into_response(), &decision);
    }

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return rate_limit_headers(AppError::InvalidRequest(e.to_string()).into_response(), &decision),
    };
    let req: RpcRequest = match rpc::validate_envelope(&value) {
        Ok(r) => r,
        Err(msg) => return rate_limit_headers(AppError::InvalidRequest(msg).into_response(), &decision),
    };

    let fingerprint = ResponseCache::fingerprint(&service_id, &value);
    if def.cache_ttl > 0 {
        if let Some(cached) = state.cache.get(&fingerprint).await {
            state.metrics.inc_cache_hits();
            return rate_limit_headers(cache_tagged_response(cached, true), &decision);
        }
    }
    state.metrics.inc_cache_misses();

    match supervisor.send_request(req).await {
        Ok(resp) => {
            let value = serde_json::to_value(&resp).unwrap_or(serde_json::Value::Null);
            // Only idempotent, error-free responses are cacheable — an
            // upstream JSON-RPC error must never be served back as a hit.
            if def.cache_ttl > 0 && resp.error.is_none() {
                state
                    .cache
                    .put(fingerprint, value.clone(), Duration::from_secs(def.cache_ttl))
                    .await;
            }
            rate_limit_headers(cache_tagged_response(value, false), &decision)
        }
        Err(e) => rate_limit_headers(e.into_response(), &decision),
    }
}

async fn service_health_response(supervisor: &crate::supervisor::Supervisor) -> Response {
    let body = serde_json::json!({
        "status": supervisor.state().await.as_str(),
        "metrics": { "restartCount": supervisor.restart_count() },
        "lastError": supervisor.last_error().await,
    });
    Json(body).into_response()
}

fn cache_tagged_response(body: serde_json::Value, hit: bool) -> Response {
    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        "x-cache",
        HeaderValue::from_static(if hit { "HIT" } else { "MISS" }),
    );
    response
}

/// The rate-limit headers (limit/remaining/reset) are set on every response
/// that passed through the limiter, success or failure alike; `retry-after`
/// is added only when the request was actually blocked.
fn rate_limit_headers(mut response: Response, decision: &Decision) -> Response {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_at_ms.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
    if !decision.allowed {
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_secs.to_string()) {
            headers.insert("retry-after", v);
        }
    }
    response
}
