//! Supervisor — owns exactly one child process for a service: spawn,
//! monitor, restart with backoff, graceful shutdown, request/response
//! correlation.
//!
//! The framer is owned here and holds no back-reference to its supervisor,
//! so the two can't form a reference cycle; the supervisor reaches into the
//! framer, never the other way around.

pub mod backoff;

use crate::error::AppError;
use crate::framer::Framer;
use crate::logs::LogSink;
use crate::metrics::Metrics;
use crate::registry::ServiceDefinition;
use crate::rpc::{RpcRequest, RpcResponse};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopped,
    Crashed,
    Restarting,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Crashed => "crashed",
            ServiceState::Restarting => "restarting",
        }
    }
}

struct Inner {
    definition: RwLock<ServiceDefinition>,
    state: RwLock<ServiceState>,
    framer: RwLock<Option<Framer>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: AtomicU32,
    restart_count: AtomicU32,
    last_error: RwLock<Option<String>>,
    logs: LogSink,
    /// Bumped every time `start`/`stop` begins, so a reaper task spawned by
    /// an earlier incarnation of the child can recognize it is stale and
    /// must not act on an exit that belongs to a process we already replaced.
    generation: AtomicU32,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(definition: ServiceDefinition, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                definition: RwLock::new(definition),
                state: RwLock::new(ServiceState::Stopped),
                framer: RwLock::new(None),
                child: tokio::sync::Mutex::new(None),
                pid: AtomicU32::new(0),
                restart_count: AtomicU32::new(0),
                last_error: RwLock::new(None),
                logs: LogSink::new(),
                generation: AtomicU32::new(0),
                metrics,
            }),
        }
    }

    pub async fn state(&self) -> ServiceState {
        *self.inner.state.read().await
    }

    pub async fn definition(&self) -> ServiceDefinition {
        self.inner.definition.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().await.clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::Relaxed)
    }

    pub async fn recent_logs(&self, limit: usize) -> Vec<crate::logs::LogLine> {
        self.inner.logs.recent(limit).await
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<crate::logs::LogLine> {
        self.inner.logs.subscribe()
    }

    /// Subscribe to the child's notification stream. Returns `None` if the
    /// service is not currently running.
    pub async fn subscribe_notifications(&self) -> Option<broadcast::Receiver<Value>> {
        self.inner.framer.read().await.as_ref().map(|f| f.subscribe_notifications())
    }

    /// Explicit user-initiated start. Clears the restart counter — a manual
    /// start always gets the full restart budget back.
    pub async fn start(&self) -> Result<(), AppError> {
        {
            let state = *self.inner.state.read().await;
            if matches!(state, ServiceState::Starting | ServiceState::Running | ServiceState::Restarting) {
                return Ok(());
            }
        }
        self.inner.restart_count.store(0, Ordering::Relaxed);
        self.spawn_internal().await
    }

    pub async fn restart(&self) -> Result<(), AppError> {
        self.stop().await;
        self.start().await
    }

    /// Idempotent — always returns `Ok`. Transitions to `stopped` *before*
    /// signalling, so a concurrent reaper/crash handler never races a restart
    /// in on top of an intentional stop.
    pub async fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.state.write().await = ServiceState::Stopped;

        let pid = self.inner.pid.swap(0, Ordering::SeqCst);
        *self.inner.framer.write().await = None;

        let mut child_guard = self.inner.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            drop(child_guard);
            if pid != 0 {
                send_signal(pid, libc::SIGTERM);
            }
            let waited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            if waited.is_err() {
                if pid != 0 {
                    send_signal(pid, libc::SIGKILL);
                }
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }

    /// `sendRequest` — blocks the caller until a response, timeout, or
    /// transport failure.
    pub async fn send_request(&self, mut req: RpcRequest) -> Result<RpcResponse, AppError> {
        let (state, timeout_ms) = {
            let state = *self.inner.state.read().await;
            let def = self.inner.definition.read().await;
            (state, def.timeout_ms)
        };
        if state != ServiceState::Running {
            return Err(AppError::IllegalState {
                status: state.as_str().to_string(),
                last_error: self.last_error().await,
            });
        }

        let framer = {
            let guard = self.inner.framer.read().await;
            guard.clone().ok_or_else(|| AppError::IllegalState {
                status: state.as_str().to_string(),
                last_error: None,
            })?
        };

        // Rewrite the id if absent or already outstanding (two concurrent
        // callers supplying the same explicit id would otherwise collide in
        // the framer's pending table), and remember the caller's original id
        // so it can be restored verbatim on the way back.
        let client_id = req.id.clone();
        let needs_rewrite = match &client_id {
            None => true,
            Some(id) => framer.has_pending(id).await,
        };
        if needs_rewrite {
            req.id = Some(framer.allocate_id());
        }
        let wire_id = req.id.clone().unwrap();

        let rx = framer
            .send_request(req)
            .await
            .map_err(AppError::TransportClosed)?;

        let deadline = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(mut resp)) => {
                if needs_rewrite {
                    resp.id = client_id.unwrap_or(Value::Null);
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(AppError::TransportClosed("response channel dropped".into())),
            Err(_) => {
                framer.cancel(&wire_id).await;
                Err(AppError::Timeout)
            }
        }
    }

    // ── internals ───────────────────────────────────────────────────────

    async fn spawn_internal(&self) -> Result<(), AppError> {
        *self.inner.state.write().await = ServiceState::Starting;
        let my_generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let def = self.inner.definition.read().await.clone();

        let mut command = Command::new(&def.entry_point);
        command
            .args(&def.args)
            .current_dir(&def.working_dir)
            .envs(&def.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group led by the child itself, so `stop` can
            // signal the whole process group, not just the direct child.
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            AppError::Internal(format!("failed to spawn {}: {e}", def.entry_point))
        })?;

        let pid = child.id().unwrap_or(0);
        self.inner.pid.store(pid, Ordering::SeqCst);

        let stdin = child.stdin.take().ok_or_else(|| AppError::Internal("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| AppError::Internal("no stdout".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| AppError::Internal("no stderr".into()))?;

        let (log_tx, mut log_rx) = mpsc::channel::<String>(256);
        let logs_for_parse_errors = self.inner.logs.clone_handle();
        tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                logs_for_parse_errors.push("warn", format!("unparsed line: {line}")).await;
            }
        });

        let framer = Framer::new(stdin, stdout, log_tx);
        *self.inner.framer.write().await = Some(framer);

        // stderr carries no frames, just diagnostics; forward it to the log
        // sink line by line.
        let stderr_logs = self.inner.logs.clone_handle();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_logs.push("info", line).await;
            }
        });

        *self.inner.child.lock().await = Some(child);
        *self.inner.state.write().await = ServiceState::Running;
        self.inner.logs.push("info", format!("started pid={pid}")).await;

        let this = self.clone();
        tokio::spawn(async move {
            this.reap(my_generation).await;
        });

        let this = self.clone();
        let interval = Duration::from_secs(def.health_check_interval_secs.max(1));
        tokio::spawn(async move {
            this.health_probe_loop(my_generation, interval).await;
        });

        Ok(())
    }

    /// Waits for the child to exit and, unless a newer generation has since
    /// replaced it (or an intentional `stop` already transitioned us to
    /// `stopped`), treats the exit as a crash.
    async fn reap(&self, generation: u32) {
        let mut child_guard = self.inner.child.lock().await;
        let wait_result = if let Some(child) = child_guard.as_mut() {
            Some(child.wait().await)
        } else {
            None
        };
        drop(child_guard);

        if generation != self.inner.generation.load(Ordering::SeqCst) {
            return; // stale generation — a newer start/stop already handled this.
        }
        if *self.inner.state.read().await != ServiceState::Running {
            return; // stop() already transitioned us away from running.
        }

        let cause = match wait_result {
            Some(Ok(status)) => format!("child exited: {status}"),
            Some(Err(e)) => format!("wait() failed: {e}"),
            None => "child missing".to_string(),
        };
        self.on_crash(generation, cause).await;
    }

    async fn health_probe_loop(&self, generation: u32, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if generation != self.inner.generation.load(Ordering::SeqCst) {
                return;
            }
            if *self.inner.state.read().await != ServiceState::Running {
                return;
            }
            let pid = self.inner.pid.load(Ordering::SeqCst);
            if pid != 0 && !is_process_alive(pid) {
                self.on_crash(generation, "health probe: process not alive".to_string()).await;
                return;
            }
        }
    }

    /// Transitions `running -> crashed`, then either schedules a restart or
    /// remains `crashed` once the restart budget is exhausted.
    async fn on_crash(&self, generation: u32, cause: String) {
        if generation != self.inner.generation.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.inner.state.write().await;
            if *state != ServiceState::Running {
                return;
            }
            *state = ServiceState::Crashed;
        }
        *self.inner.last_error.write().await = Some(cause.clone());
        *self.inner.framer.write().await = None;
        self.inner.pid.store(0, Ordering::SeqCst);
        warn!(cause = %cause, "service crashed");
        self.inner.logs.push("error", format!("crashed: {cause}")).await;

        let def = self.inner.definition.read().await.clone();
        let attempt = self.inner.restart_count.load(Ordering::Relaxed);
        if def.auto_restart && attempt < def.max_restarts {
            self.inner.restart_count.fetch_add(1, Ordering::Relaxed);
            self.inner.metrics.inc_restarts_total();
            *self.inner.state.write().await = ServiceState::Restarting;
            let delay = backoff::restart_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling restart");
            tokio::time::sleep(delay).await;

            if generation != self.inner.generation.load(Ordering::SeqCst) {
                return; // superseded by an explicit stop/start while sleeping
            }
            if let Err(e) = self.spawn_internal().await {
                warn!(err = %e, "restart attempt failed to spawn");
                *self.inner.state.write().await = ServiceState::Crashed;
                *self.inner.last_error.write().await = Some(e.to_string());
            }
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: i32) {
    // Negative pid targets the whole process group rather than just the leader.
    unsafe {
        libc::kill(-(pid as libc::pid_t), sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _sig: i32) {}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::DesiredStatus;
    use std::collections::HashMap;

    fn echo_definition(dir: &std::path::Path) -> ServiceDefinition {
        ServiceDefinition {
            id: "svc-1".into(),
            name: "echo".into(),
            entry_point: "sh".into(),
            working_dir: dir.to_string_lossy().to_string(),
            args: vec!["-c".into(), "cat".into()],
            env: HashMap::new(),
            proxy_path: "/mcp/echo".into(),
            rate_limit: 100,
            cache_ttl: 0,
            timeout_ms: 2000,
            auto_restart: false,
            max_restarts: 0,
            health_check_interval_secs: 3600,
            desired_status: DesiredStatus::Stopped,
        }
    }

    #[tokio::test]
    async fn start_transitions_to_running_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(echo_definition(dir.path()), Arc::new(Metrics::new()));
        sup.start().await.unwrap();
        assert_eq!(sup.state().await, ServiceState::Running);
        sup.stop().await;
        assert_eq!(sup.state().await, ServiceState::Stopped);
        sup.stop().await; // idempotent
        assert_eq!(sup.state().await, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn send_request_fails_illegal_state_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(echo_definition(dir.path()), Arc::new(Metrics::new()));
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(Value::from(1)),
            method: "ping".into(),
            params: None,
        };
        let err = sup.send_request(req).await.unwrap_err();
        assert!(matches!(err, AppError::IllegalState { .. }));
    }
}
