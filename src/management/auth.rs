//! Management surface authentication — `X-API-Key` header or `api_key`
//! query parameter, checked against the registry's hashed key table.

use crate::error::AppError;
use crate::AppState;
use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::Arc;

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.config.require_api_key {
        return Ok(next.run(request).await);
    }

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let key = header_key.or_else(|| query.get("api_key").cloned());

    let key = match key {
        Some(k) if !k.is_empty() => k,
        _ => return Err(AppError::Unauthorized),
    };

    let valid = state
        .registry
        .check_api_key(&key)
        .await
        .map_err(AppError::internal)?;
    if !valid {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
