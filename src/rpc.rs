//! JSON-RPC 2.0 wire types.
//!
//! Parsing yields a tagged variant — request, response, notification, or
//! invalid — so downstream code never has to re-inspect raw `Value`s for
//! `id`/`result`/`error` presence. The raw bytes are kept alongside the
//! parsed form through the cache layer so a cache hit can return a
//! byte-identical response to what the upstream process actually sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObj>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcErrorObj {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A parsed JSON-RPC message, tagged by shape rather than re-derived ad hoc
/// at every call site.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    /// No `id` — either a true notification or a server-initiated request,
    /// both delivered out-of-band the same way.
    Notification(Value),
    Invalid(String),
}

/// Parse one line of child stdout into a tagged message. Never fails —
/// parse errors become `Invalid` so the caller can log-and-continue.
pub fn parse_line(line: &str) -> RpcMessage {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return RpcMessage::Invalid(e.to_string()),
    };

    let has_id = value.get("id").is_some();
    let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();

    if has_id && has_result_or_error {
        match serde_json::from_value::<RpcResponse>(value) {
            Ok(r) => RpcMessage::Response(r),
            Err(e) => RpcMessage::Invalid(e.to_string()),
        }
    } else if !has_id {
        RpcMessage::Notification(value)
    } else {
        match serde_json::from_value::<RpcRequest>(value.clone()) {
            Ok(r) => RpcMessage::Request(r),
            Err(_) => RpcMessage::Notification(value),
        }
    }
}

/// Validate the envelope: `jsonrpc` must be `"2.0"`, `method` a non-empty
/// string, `id` string/number/absent.
pub fn validate_envelope(value: &Value) -> Result<RpcRequest, String> {
    let jsonrpc = value
        .get("jsonrpc")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing jsonrpc".to_string())?;
    if jsonrpc != JSONRPC_VERSION {
        return Err(format!("jsonrpc must be \"{JSONRPC_VERSION}\""));
    }

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing method".to_string())?;
    if method.is_empty() {
        return Err("method must be non-empty".to_string());
    }

    if let Some(id) = value.get("id") {
        if !(id.is_string() || id.is_number() || id.is_null()) {
            return Err("id must be string, number, or absent".to_string());
        }
    }

    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

pub fn error_response(id: Value, code: i32, message: impl Into<String>) -> RpcResponse {
    RpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: None,
        error: Some(RpcErrorObj {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_well_formed_request() {
        let v = serde_json::json!({"jsonrpc":"2.0","method":"ping","id":7});
        let req = validate_envelope(&v).unwrap();
        assert_eq!(req.method, "ping");
    }

    #[test]
    fn rejects_empty_method() {
        let v = serde_json::json!({"jsonrpc":"2.0","method":""});
        assert!(validate_envelope(&v).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let v = serde_json::json!({"jsonrpc":"1.0","method":"ping"});
        assert!(validate_envelope(&v).is_err());
    }

    #[test]
    fn parse_line_distinguishes_response_from_request() {
        let resp = parse_line(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert!(matches!(resp, RpcMessage::Response(_)));

        let notif = parse_line(r#"{"jsonrpc":"2.0","method":"progress","params":{}}"#);
        assert!(matches!(notif, RpcMessage::Notification(_)));

        let invalid = parse_line("not json");
        assert!(matches!(invalid, RpcMessage::Invalid(_)));
    }
}
