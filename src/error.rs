//! Core error taxonomy — one enum, one mapping to HTTP + JSON-RPC.
//!
//! Every boundary (proxy router, management surface) surfaces one of these
//! variants; nothing is swallowed silently. Background-only failures (health
//! probe misses, sub-threshold framer parse errors) are logged directly at
//! their call site instead of being turned into an `AppError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// JSON-RPC 2.0 reserved error codes used throughout the proxy path.
pub mod rpc_code {
    pub const INVALID_REQUEST: i32 = -32600;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("no such service or route")]
    NotFound,

    #[error("service is not running")]
    IllegalState { status: String, last_error: Option<String> },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid JSON-RPC envelope: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("request timed out waiting for child")]
    Timeout,

    #[error("child transport closed: {0}")]
    TransportClosed(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({ "error": "not_found" }),
            ),
            AppError::IllegalState { status, last_error } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "illegal_state", "status": status, "lastError": last_error }),
            ),
            AppError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "rate_limited", "retryAfter": retry_after_secs }),
            ),
            AppError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": rpc_code::INVALID_REQUEST, "message": msg }
                }),
            ),
            AppError::InvalidParams(msg) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": rpc_code::INVALID_PARAMS, "message": msg }
                }),
            ),
            AppError::Timeout => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": rpc_code::INTERNAL_ERROR, "message": "Internal error" }
                }),
            ),
            AppError::TransportClosed(cause) => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": rpc_code::INTERNAL_ERROR, "message": cause }
                }),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized" }),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": rpc_code::INTERNAL_ERROR, "message": msg }
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
