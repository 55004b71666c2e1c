//! WebSocket bridging — relays client JSON-RPC requests to the matched
//! supervisor and fans the supervisor's server-initiated notifications back
//! out to the client, for the lifetime of the socket.

use crate::rpc;
use crate::supervisor::Supervisor;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::warn;

pub async fn handle(socket: WebSocket, state: Arc<AppState>, supervisor: Supervisor) {
    let (mut sink, mut stream) = socket.split();
    let mut notifications = match supervisor.subscribe_notifications().await {
        Some(rx) => rx,
        None => {
            let err = rpc::error_response(
                serde_json::Value::Null,
                crate::error::rpc_code::INTERNAL_ERROR,
                "service is not running",
            );
            let body = serde_json::to_string(&err).unwrap_or_default();
            let _ = sink.send(Message::Text(body.into())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        state.metrics.inc_requests_total();
                        // Validate the frame against the same JSON-RPC envelope
                        // rules the HTTP path uses (`jsonrpc`/`method`/`id` shape) —
                        // an absent `id` is a *valid* request here, since `sendRequest`
                        // rewrites and restores it, not grounds for a -32600.
                        let parsed: Result<rpc::RpcRequest, String> = serde_json::from_str::<serde_json::Value>(&text)
                            .map_err(|e| e.to_string())
                            .and_then(|value| rpc::validate_envelope(&value));
                        match parsed {
                            Ok(req) => {
                                match supervisor.send_request(req).await {
                                    Ok(resp) => {
                                        let body = serde_json::to_string(&resp).unwrap_or_default();
                                        if sink.send(Message::Text(body.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        let body = serde_json::to_string(&serde_json::json!({
                                            "jsonrpc": "2.0",
                                            "id": null,
                                            "error": { "message": e.to_string() }
                                        })).unwrap_or_default();
                                        if sink.send(Message::Text(body.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(msg) => {
                                let err = rpc::error_response(
                                    serde_json::Value::Null,
                                    crate::error::rpc_code::INVALID_REQUEST,
                                    msg,
                                );
                                let body = serde_json::to_string(&err).unwrap_or_default();
                                if sink.send(Message::Text(body.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(err = %e, "proxy websocket read error");
                        break;
                    }
                }
            }
            notif = notifications.recv() => {
                match notif {
                    Ok(value) => {
                        let body = serde_json::to_string(&value).unwrap_or_default();
                        if sink.send(Message::Text(body.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "client fell behind notification stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
