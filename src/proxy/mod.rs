//! Reverse proxy surface — routes inbound HTTP POST and WebSocket upgrades
//! to the supervisor whose service's `proxy_path` longest-matches the
//! request path, applying rate limiting and response caching along the way.

pub mod http;
pub mod websocket;

use crate::AppState;
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;

/// Fixed WebSocket upgrade path spec.md §4.6/§4.9 names as
/// `/{upgradePath}?service={id}` — distinct from the per-service
/// `{proxyPath}/*` fallback, which also upgrades but is keyed by path prefix
/// rather than an explicit `service` id.
pub const UPGRADE_PATH: &str = "/ws";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(UPGRADE_PATH, get(http::fixed_ws_upgrade))
        .fallback(any(http::proxy_handler))
}
