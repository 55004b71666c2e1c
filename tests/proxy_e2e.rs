//! End-to-end tests against the real proxy router — a child process is
//! actually spawned for each service, and requests travel through
//! `proxy::router()` exactly as `main.rs` assembles it. Built the same way
//! `tests/management_api.rs` drives the management surface: `oneshot` for
//! plain HTTP, a real bound listener + `tokio_tungstenite` client for the
//! WebSocket path, matching the daemon's own
//! `cli_account_integration.rs` pattern of starting the app in-process and
//! connecting to it like a real client would.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use mcpd::config::Config;
use mcpd::registry::{CreateServiceRequest, Registry};
use mcpd::{management, proxy, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

/// A tiny JSON-RPC "MCP server" driven entirely by `method`: `echo` replies
/// with its params, `notify` emits an unsolicited notification before
/// replying, `crash` exits the process without replying, `hang` never
/// replies. Good enough to drive every scenario in the wire protocol without
/// depending on a real MCP implementation.
const ECHO_SCRIPT: &str = r#"
import json
import sys
import time

for raw in sys.stdin:
    raw = raw.strip()
    if not raw:
        continue
    try:
        req = json.loads(raw)
    except Exception:
        continue
    method = req.get("method")
    rid = req.get("id")
    if method == "crash":
        sys.exit(1)
    if method == "hang":
        time.sleep(30)
        continue
    if method == "notify":
        note = {"jsonrpc": "2.0", "method": "tick", "params": {"seq": 1}}
        sys.stdout.write(json.dumps(note) + "\n")
        sys.stdout.flush()
    resp = {"jsonrpc": "2.0", "id": rid, "result": {"echo": req.get("params")}}
    sys.stdout.write(json.dumps(resp) + "\n")
    sys.stdout.flush()
"#;

async fn test_state(dir: &Path) -> Arc<AppState> {
    let config = Config::new(Some(0), Some(dir.to_path_buf()), Some("error".to_string()));
    let registry = Registry::new(dir).await.unwrap();
    Arc::new(AppState::new(config, registry))
}

fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .nest("/management", management::router(state.clone()).with_state(state.clone()))
        .merge(proxy::router().with_state(state.clone()))
}

fn write_echo_script(dir: &Path) -> String {
    let path = dir.join("echo_server.py");
    std::fs::write(&path, ECHO_SCRIPT).unwrap();
    path.to_string_lossy().to_string()
}

/// Register and start a service backed by `echo_server.py`, returning its id.
async fn start_echo_service(
    state: &Arc<AppState>,
    dir: &Path,
    proxy_path: &str,
    overrides: impl FnOnce(&mut CreateServiceRequest),
) -> String {
    let script = write_echo_script(dir);
    let mut req = CreateServiceRequest {
        name: "echo".into(),
        entry_point: "python3".into(),
        working_dir: dir.to_string_lossy().to_string(),
        args: vec!["-u".into(), script],
        env: HashMap::new(),
        proxy_path: proxy_path.into(),
        rate_limit: 100,
        cache_ttl: 0,
        timeout_ms: 2000,
        auto_restart: false,
        max_restarts: 0,
        health_check_interval_secs: 3600,
    };
    overrides(&mut req);

    let definition = state.registry.create_service(req).await.unwrap();
    state.process_manager.add(definition.clone()).await.unwrap();
    state.process_manager.start(&definition.id).await.unwrap();
    definition.id
}

fn rpc_body(id: i64, method: &str, params: serde_json::Value) -> Body {
    Body::from(
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
            .to_string(),
    )
}

#[tokio::test]
async fn echo_round_trip_through_the_real_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    start_echo_service(&state, dir.path(), "/mcp/echo", |_| {}).await;

    let response = app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp/echo")
                .body(rpc_body(1, "echo", serde_json::json!({"x": 1})))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["result"]["echo"], serde_json::json!({"x": 1}));
    assert_eq!(value["id"], 1);
}

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    start_echo_service(&state, dir.path(), "/mcp/cached", |req| req.cache_ttl = 60).await;
    let app = app(state);

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/mcp/cached")
            .body(rpc_body(1, "echo", serde_json::json!({"x": 1})))
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");

    let second = app.oneshot(request()).await.unwrap();
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
}

#[tokio::test]
async fn rate_limit_rejects_the_second_request_in_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    start_echo_service(&state, dir.path(), "/mcp/limited", |req| req.rate_limit = 1).await;
    let app = app(state);

    let request = |id: i64| {
        Request::builder()
            .method("POST")
            .uri("/mcp/limited")
            .body(rpc_body(id, "echo", serde_json::json!({})))
            .unwrap()
    };

    let first = app.clone().oneshot(request(1)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(request(2)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    assert!(second.headers().contains_key("x-ratelimit-limit"));
}

#[tokio::test]
async fn request_past_the_timeout_deadline_surfaces_as_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    start_echo_service(&state, dir.path(), "/mcp/slow", |req| req.timeout_ms = 200).await;

    let response = app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp/slow")
                .body(rpc_body(1, "hang", serde_json::json!({})))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"]["code"], -32603);
}

#[tokio::test]
async fn crashed_service_auto_restarts_and_serves_again() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let id = start_echo_service(&state, dir.path(), "/mcp/flaky", |req| {
        req.auto_restart = true;
        req.max_restarts = 3;
    })
    .await;
    let app = app(state.clone());

    let crash_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp/flaky")
                .body(rpc_body(1, "crash", serde_json::json!({})))
                .unwrap(),
        )
        .await
        .unwrap();
    // The in-flight request itself just sees the transport close, not a
    // crash per se — the restart happens on the supervisor's own clock.
    assert_eq!(crash_response.status(), StatusCode::OK);

    let supervisor = state.process_manager.get(&id).await.unwrap();
    let restarted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if supervisor.state().await == mcpd::supervisor::ServiceState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(restarted.is_ok(), "service did not come back up after crashing");
    assert!(supervisor.restart_count() >= 1);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp/flaky")
                .body(rpc_body(2, "echo", serde_json::json!({"after": "restart"})))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn websocket_notification_fans_out_to_every_connected_client() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let id = start_echo_service(&state, dir.path(), "/mcp/notify", |_| {}).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let make_service = app(state).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, make_service).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://{addr}{}?service={id}", proxy::UPGRADE_PATH);
    let (mut client_a, _) = tokio_tungstenite::connect_async(&url).await.expect("client A connect");
    let (mut client_b, _) = tokio_tungstenite::connect_async(&url).await.expect("client B connect");

    let notify_request = serde_json::json!({
        "jsonrpc": "2.0", "id": 1, "method": "notify", "params": {}
    });
    client_a
        .send(WsMessage::Text(notify_request.to_string()))
        .await
        .unwrap();

    // Client A sees both its own response and the notification (order not
    // guaranteed); client B, which sent nothing, must still see the
    // notification broadcast to it.
    let a_frames = tokio::time::timeout(Duration::from_secs(2), async {
        let mut seen_notification = false;
        let mut seen_response = false;
        while !(seen_notification && seen_response) {
            let msg = client_a.next().await.unwrap().unwrap();
            if let WsMessage::Text(t) = msg {
                let value: serde_json::Value = serde_json::from_str(&t).unwrap();
                if value["method"] == "tick" {
                    seen_notification = true;
                }
                if value["id"] == 1 {
                    seen_response = true;
                }
            }
        }
    })
    .await;
    assert!(a_frames.is_ok(), "client A did not see both its response and the notification");

    let b_notification = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let msg = client_b.next().await.unwrap().unwrap();
            if let WsMessage::Text(t) = msg {
                let value: serde_json::Value = serde_json::from_str(&t).unwrap();
                if value["method"] == "tick" {
                    return;
                }
            }
        }
    })
    .await;
    assert!(b_notification.is_ok(), "client B (idle) never received the fanned-out notification");
}
