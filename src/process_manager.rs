//! Process Manager — the registry of live supervisors, keyed by service id.
//!
//! Owns the mapping from a durable `ServiceDefinition` to its running
//! `Supervisor`, and reconciles that mapping against the registry's
//! `desired_status` column at startup so services marked `running` before
//! a restart come back up automatically.

use crate::error::AppError;
use crate::metrics::Metrics;
use crate::registry::{DesiredStatus, Registry};
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Global deadline for `stop_all` — each supervisor's own graceful-then-kill
/// sequence can take up to 5s, but the fleet stops concurrently against this
/// one shared bound rather than serially against each supervisor's own.
const STOP_ALL_DEADLINE: Duration = Duration::from_secs(8);

#[derive(Clone)]
pub struct ProcessManager {
    registry: Registry,
    metrics: Arc<Metrics>,
    supervisors: Arc<RwLock<HashMap<String, Supervisor>>>,
}

/// `total`/`running`/`stopped` counts surfaced at `GET /health`. "Stopped"
/// here means anything other than `running` — crashed, restarting, or
/// genuinely stopped — since the top-level liveness probe only cares
/// whether a service is actively serving traffic.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ServiceCounts {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

impl ProcessManager {
    pub fn new(registry: Registry, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            metrics,
            supervisors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Boot-time reconciliation: load every service definition, create a
    /// supervisor for each, and start the ones whose `desired_status` is
    /// `running`.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let definitions = self.registry.list_services().await?;
        for def in definitions {
            let id = def.id.clone();
            let desired = def.desired_status;
            let supervisor = Supervisor::new(def, self.metrics.clone());
            self.supervisors.write().await.insert(id.clone(), supervisor.clone());
            if desired == DesiredStatus::Running {
                info!(service_id = %id, "reconciling: starting service marked running");
                if let Err(e) = supervisor.start().await {
                    warn!(service_id = %id, err = %e, "failed to start during reconciliation");
                }
            }
        }
        Ok(())
    }

    /// Register a freshly created service definition and return its
    /// supervisor. Fails if `id` is already registered — callers that mean
    /// to replace a live supervisor (e.g. after an update) must go through
    /// `replace` instead, which stops the old one first.
    pub async fn add(&self, definition: crate::registry::ServiceDefinition) -> Result<Supervisor, AppError> {
        let id = definition.id.clone();
        let mut supervisors = self.supervisors.write().await;
        if supervisors.contains_key(&id) {
            return Err(AppError::InvalidRequest(format!("service '{id}' is already registered")));
        }
        let supervisor = Supervisor::new(definition, self.metrics.clone());
        supervisors.insert(id, supervisor.clone());
        Ok(supervisor)
    }

    /// Replace the supervisor for an existing service id, stopping whatever
    /// supervisor (and live child process) was previously registered under
    /// it first so an update never orphans a running process.
    pub async fn replace(&self, definition: crate::registry::ServiceDefinition) -> Supervisor {
        let id = definition.id.clone();
        let previous = self.supervisors.write().await.remove(&id);
        if let Some(old) = previous {
            old.stop().await;
        }
        let supervisor = Supervisor::new(definition, self.metrics.clone());
        self.supervisors.write().await.insert(id, supervisor.clone());
        supervisor
    }

    pub async fn get(&self, id: &str) -> Option<Supervisor> {
        self.supervisors.read().await.get(id).cloned()
    }

    /// Remove and stop a supervisor, used by service deletion.
    pub async fn remove(&self, id: &str) {
        let removed = self.supervisors.write().await.remove(id);
        if let Some(supervisor) = removed {
            supervisor.stop().await;
        }
    }

    /// Look up a supervisor by its proxy path prefix — the longest matching
    /// prefix wins, so `/mcp/foo/bar` routes to a service registered at
    /// `/mcp/foo/bar` over one registered at `/mcp/foo`.
    pub async fn find_by_path(&self, path: &str) -> Option<(String, Supervisor)> {
        let supervisors = self.supervisors.read().await;
        let mut best: Option<(String, Supervisor, usize)> = None;
        for (id, supervisor) in supervisors.iter() {
            let def = supervisor.definition().await;
            let matches = path == def.proxy_path || path.starts_with(&format!("{}/", def.proxy_path));
            if !matches {
                continue;
            }
            let len = def.proxy_path.len();
            if best.as_ref().map(|(_, _, best_len)| len > *best_len).unwrap_or(true) {
                best = Some((id.clone(), supervisor.clone(), len));
            }
        }
        best.map(|(id, supervisor, _)| (id, supervisor))
    }

    pub async fn start(&self, id: &str) -> Result<(), AppError> {
        let supervisor = self.get(id).await.ok_or(AppError::NotFound)?;
        supervisor.start().await?;
        self.registry
            .set_desired_status(id, DesiredStatus::Running)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<(), AppError> {
        let supervisor = self.get(id).await.ok_or(AppError::NotFound)?;
        supervisor.stop().await;
        self.registry
            .set_desired_status(id, DesiredStatus::Stopped)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(())
    }

    pub async fn restart(&self, id: &str) -> Result<(), AppError> {
        let supervisor = self.get(id).await.ok_or(AppError::NotFound)?;
        supervisor.restart().await?;
        self.registry
            .set_desired_status(id, DesiredStatus::Running)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Counts for the top-level `GET /health` liveness body: total
    /// supervised services and how many are currently `running` vs not.
    pub async fn service_counts(&self) -> ServiceCounts {
        let supervisors: Vec<Supervisor> = self.supervisors.read().await.values().cloned().collect();
        let total = supervisors.len();
        let mut running = 0;
        for supervisor in &supervisors {
            if supervisor.state().await == crate::supervisor::ServiceState::Running {
                running += 1;
            }
        }
        ServiceCounts { total, running, stopped: total - running }
    }

    /// Stop every supervisor concurrently, capped by one shared deadline —
    /// used at shutdown so N services don't serialize to `5s * N` through
    /// each supervisor's own SIGTERM-then-SIGKILL wait.
    pub async fn stop_all(&self) {
        let supervisors: Vec<Supervisor> = self.supervisors.read().await.values().cloned().collect();
        let stops = supervisors.into_iter().map(|supervisor| async move {
            if tokio::time::timeout(STOP_ALL_DEADLINE, supervisor.stop()).await.is_err() {
                warn!("supervisor did not stop within the shutdown deadline");
            }
        });
        futures_util::future::join_all(stops).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CreateServiceRequest;
    use std::collections::HashMap as StdHashMap;

    fn req(proxy_path: &str) -> CreateServiceRequest {
        CreateServiceRequest {
            name: "svc".into(),
            entry_point: "sh".into(),
            working_dir: "/tmp".into(),
            args: vec!["-c".into(), "cat".into()],
            env: StdHashMap::new(),
            proxy_path: proxy_path.into(),
            rate_limit: 100,
            cache_ttl: 0,
            timeout_ms: 2000,
            auto_restart: false,
            max_restarts: 0,
            health_check_interval_secs: 3600,
        }
    }

    #[tokio::test]
    async fn find_by_path_prefers_longer_prefix() {
        let registry = Registry::in_memory().await.unwrap();
        let outer = registry.create_service(req("/mcp/foo")).await.unwrap();
        let inner = registry.create_service(req("/mcp/foo/bar")).await.unwrap();
        let pm = ProcessManager::new(registry, Arc::new(Metrics::new()));
        pm.add(outer.clone()).await.unwrap();
        pm.add(inner.clone()).await.unwrap();

        let (matched_id, _) = pm.find_by_path("/mcp/foo/bar/baz").await.unwrap();
        assert_eq!(matched_id, inner.id);
    }

    #[tokio::test]
    async fn start_stop_updates_desired_status() {
        let registry = Registry::in_memory().await.unwrap();
        let def = registry.create_service(req("/mcp/x")).await.unwrap();
        let pm = ProcessManager::new(registry.clone(), Arc::new(Metrics::new()));
        pm.add(def.clone()).await.unwrap();

        pm.start(&def.id).await.unwrap();
        assert_eq!(registry.get_service(&def.id).await.unwrap().desired_status, DesiredStatus::Running);

        pm.stop(&def.id).await.unwrap();
        assert_eq!(registry.get_service(&def.id).await.unwrap().desired_status, DesiredStatus::Stopped);
    }
}
