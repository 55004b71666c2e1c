//! Service Registry — durable service definitions, issued API keys, and the
//! settings key-value façade.
//!
//! A single `SqlitePool` in WAL mode, a query timeout wrapper, and
//! `sqlx::FromRow` row structs mapped into domain types at the boundary.

pub mod models;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

pub use models::{ApiKeyRow, CreateServiceRequest, DesiredStatus, ServiceDefinition, ServiceRow, UpdateServiceRequest};

/// Prevents a hung query from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(r) => r,
        Err(_) => Err(anyhow!("registry query timed out after {}s", QUERY_TIMEOUT.as_secs())),
    }
}

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("proxy path already in use: {0}")]
    DuplicateProxyPath(String),
    #[error("no such service: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Registry {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::open(data_dir, None).await
    }

    /// `database_url` overrides the default `{data_dir}/mcpd.db` location —
    /// sourced from the bootstrap `DATABASE_URL` env var, since the registry
    /// location is the one piece of configuration needed before the store
    /// it would otherwise live in is available.
    pub async fn open(data_dir: &Path, database_url: Option<&str>) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let url = match database_url {
            Some(url) => url.to_string(),
            None => format!("sqlite://{}?mode=rwc", data_dir.join("mcpd.db").display()),
        };
        let opts = SqliteConnectOptions::from_str(&url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory pool, for tests — same schema, no file on disk.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(include_str!("migrations/001_init.sql"))
            .execute(pool)
            .await
            .context("running registry migrations")?;
        Ok(())
    }

    // ── Services ────────────────────────────────────────────────────────

    pub async fn create_service(&self, req: CreateServiceRequest) -> Result<ServiceDefinition, RegistryError> {
        if req.timeout_ms == 0 {
            return Err(RegistryError::Other(anyhow!("timeout must be > 0")));
        }
        let id = Uuid::new_v4().to_string();
        let args_json = serde_json::to_string(&req.args)?;
        let env_json = serde_json::to_string(&req.env)?;

        let result = with_timeout(async {
            sqlx::query(
                r#"INSERT INTO services
                   (id, name, entry_point, working_dir, args_json, env_json, proxy_path,
                    rate_limit, cache_ttl, timeout_ms, auto_restart, max_restarts,
                    health_check_interval_secs, desired_status)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'stopped')"#,
            )
            .bind(&id)
            .bind(&req.name)
            .bind(&req.entry_point)
            .bind(&req.working_dir)
            .bind(&args_json)
            .bind(&env_json)
            .bind(&req.proxy_path)
            .bind(req.rate_limit as i64)
            .bind(req.cache_ttl as i64)
            .bind(req.timeout_ms as i64)
            .bind(req.auto_restart)
            .bind(req.max_restarts as i64)
            .bind(req.health_check_interval_secs as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
        })
        .await;

        if let Err(e) = result {
            let msg = e.to_string();
            if msg.contains("UNIQUE constraint failed") && msg.contains("proxy_path") {
                return Err(RegistryError::DuplicateProxyPath(req.proxy_path));
            }
            return Err(RegistryError::Other(e));
        }

        Ok(ServiceDefinition {
            id,
            name: req.name,
            entry_point: req.entry_point,
            working_dir: req.working_dir,
            args: req.args,
            env: req.env,
            proxy_path: req.proxy_path,
            rate_limit: req.rate_limit,
            cache_ttl: req.cache_ttl,
            timeout_ms: req.timeout_ms,
            auto_restart: req.auto_restart,
            max_restarts: req.max_restarts,
            health_check_interval_secs: req.health_check_interval_secs,
            desired_status: DesiredStatus::Stopped,
        })
    }

    pub async fn get_service(&self, id: &str) -> Result<ServiceDefinition, RegistryError> {
        let row: Option<ServiceRow> = with_timeout(async {
            sqlx::query_as("SELECT * FROM services WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        row.ok_or_else(|| RegistryError::NotFound(id.to_string()))?
            .into_definition()
            .map_err(RegistryError::Other)
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceDefinition>> {
        let rows: Vec<ServiceRow> = with_timeout(async {
            sqlx::query_as("SELECT * FROM services ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        rows.into_iter().map(|r| r.into_definition()).collect()
    }

    pub async fn update_service(
        &self,
        id: &str,
        req: UpdateServiceRequest,
    ) -> Result<ServiceDefinition, RegistryError> {
        let mut current = self.get_service(id).await?;
        if let Some(v) = req.name {
            current.name = v;
        }
        if let Some(v) = req.entry_point {
            current.entry_point = v;
        }
        if let Some(v) = req.working_dir {
            current.working_dir = v;
        }
        if let Some(v) = req.args {
            current.args = v;
        }
        if let Some(v) = req.env {
            current.env = v;
        }
        if let Some(v) = req.proxy_path {
            current.proxy_path = v;
        }
        if let Some(v) = req.rate_limit {
            current.rate_limit = v;
        }
        if let Some(v) = req.cache_ttl {
            current.cache_ttl = v;
        }
        if let Some(v) = req.timeout_ms {
            if v == 0 {
                return Err(RegistryError::Other(anyhow!("timeout must be > 0")));
            }
            current.timeout_ms = v;
        }
        if let Some(v) = req.auto_restart {
            current.auto_restart = v;
        }
        if let Some(v) = req.max_restarts {
            current.max_restarts = v;
        }
        if let Some(v) = req.health_check_interval_secs {
            current.health_check_interval_secs = v;
        }

        let args_json = serde_json::to_string(&current.args).map_err(|e| RegistryError::Other(e.into()))?;
        let env_json = serde_json::to_string(&current.env).map_err(|e| RegistryError::Other(e.into()))?;

        let result = with_timeout(async {
            sqlx::query(
                r#"UPDATE services SET name=?, entry_point=?, working_dir=?, args_json=?, env_json=?,
                   proxy_path=?, rate_limit=?, cache_ttl=?, timeout_ms=?, auto_restart=?, max_restarts=?,
                   health_check_interval_secs=? WHERE id=?"#,
            )
            .bind(&current.name)
            .bind(&current.entry_point)
            .bind(&current.working_dir)
            .bind(&args_json)
            .bind(&env_json)
            .bind(&current.proxy_path)
            .bind(current.rate_limit as i64)
            .bind(current.cache_ttl as i64)
            .bind(current.timeout_ms as i64)
            .bind(current.auto_restart)
            .bind(current.max_restarts as i64)
            .bind(current.health_check_interval_secs as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
        })
        .await;

        if let Err(e) = result {
            let msg = e.to_string();
            if msg.contains("UNIQUE constraint failed") && msg.contains("proxy_path") {
                return Err(RegistryError::DuplicateProxyPath(current.proxy_path));
            }
            return Err(RegistryError::Other(e));
        }

        Ok(current)
    }

    pub async fn delete_service(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM services WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        Ok(())
    }

    /// Persist a user-initiated desired-status change. This is the *only*
    /// path that writes `desired_status`; automatic crash/restart
    /// transitions never call this, so a restart storm never rewrites it.
    pub async fn set_desired_status(&self, id: &str, status: DesiredStatus) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE services SET desired_status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        Ok(())
    }

    // ── API keys ────────────────────────────────────────────────────────

    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Issue a new API key. Returns the plaintext secret once; only its hash
    /// is ever persisted, so a database leak never exposes a usable key.
    pub async fn issue_api_key(&self, name: &str) -> Result<(String, String)> {
        let id = Uuid::new_v4().to_string();
        let secret = Uuid::new_v4().to_string().replace('-', "");
        let hash = Self::hash_secret(&secret);
        with_timeout(async {
            sqlx::query("INSERT INTO api_keys (id, name, hash, active) VALUES (?, ?, ?, 1)")
                .bind(&id)
                .bind(name)
                .bind(&hash)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        Ok((id, secret))
    }

    /// Validate a presented secret against the active-key table, updating
    /// `last_used_at` on success.
    pub async fn check_api_key(&self, secret: &str) -> Result<bool> {
        let hash = Self::hash_secret(secret);
        let row: Option<ApiKeyRow> = with_timeout(async {
            sqlx::query_as("SELECT * FROM api_keys WHERE hash = ? AND active = 1")
                .bind(&hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        match row {
            Some(row) => {
                let now = Utc::now().to_rfc3339();
                let _ = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
                    .bind(&now)
                    .bind(&row.id)
                    .execute(&self.pool)
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn revoke_api_key(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE api_keys SET active = 0 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        Ok(())
    }

    // ── Settings façade ─────────────────────────────────────────────────

    /// Read-through to the (externally encrypted) settings store. The
    /// registry never encrypts or decrypts values itself — it only persists
    /// whatever bytes and `encrypted` flag the caller hands it.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = with_timeout(async {
            sqlx::query_as("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow!(e))
        })
        .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str, encrypted: bool, category: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO settings (key, value, encrypted, category) VALUES (?, ?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, encrypted = excluded.encrypted",
            )
            .bind(key)
            .bind(value)
            .bind(encrypted)
            .bind(category)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_req(proxy_path: &str) -> CreateServiceRequest {
        CreateServiceRequest {
            name: "echo".into(),
            entry_point: "echo.js".into(),
            working_dir: "/tmp".into(),
            args: vec![],
            env: Default::default(),
            proxy_path: proxy_path.into(),
            rate_limit: 100,
            cache_ttl: 60,
            timeout_ms: 5000,
            auto_restart: true,
            max_restarts: 2,
            health_check_interval_secs: 30,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let reg = Registry::in_memory().await.unwrap();
        let created = reg.create_service(sample_req("/mcp/a")).await.unwrap();
        let fetched = reg.get_service(&created.id).await.unwrap();
        assert_eq!(fetched.proxy_path, "/mcp/a");
        assert_eq!(fetched.max_restarts, 2);
    }

    #[tokio::test]
    async fn duplicate_proxy_path_rejected() {
        let reg = Registry::in_memory().await.unwrap();
        reg.create_service(sample_req("/mcp/dup")).await.unwrap();
        let err = reg.create_service(sample_req("/mcp/dup")).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProxyPath(_)));
    }

    #[tokio::test]
    async fn api_key_round_trip_and_hash_only_storage() {
        let reg = Registry::in_memory().await.unwrap();
        let (_, secret) = reg.issue_api_key("test-key").await.unwrap();
        assert!(reg.check_api_key(&secret).await.unwrap());
        assert!(!reg.check_api_key("wrong-secret").await.unwrap());
    }

    #[tokio::test]
    async fn revoked_key_is_rejected() {
        let reg = Registry::in_memory().await.unwrap();
        let (id, secret) = reg.issue_api_key("test-key").await.unwrap();
        reg.revoke_api_key(&id).await.unwrap();
        assert!(!reg.check_api_key(&secret).await.unwrap());
    }

    #[tokio::test]
    async fn desired_status_updates_only_via_explicit_call() {
        let reg = Registry::in_memory().await.unwrap();
        let created = reg.create_service(sample_req("/mcp/b")).await.unwrap();
        assert_eq!(created.desired_status, DesiredStatus::Stopped);
        reg.set_desired_status(&created.id, DesiredStatus::Running).await.unwrap();
        let fetched = reg.get_service(&created.id).await.unwrap();
        assert_eq!(fetched.desired_status, DesiredStatus::Running);
    }
}
