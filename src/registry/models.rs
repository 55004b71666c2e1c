//! Durable and derived data types for the service registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Desired persisted status, recovered at Process Manager boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

impl DesiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredStatus::Running => "running",
            DesiredStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => DesiredStatus::Running,
            _ => DesiredStatus::Stopped,
        }
    }
}

/// A durable service definition: what to run, how to reach it, and the
/// policy knobs (rate limit, cache TTL, restart behavior) that govern it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,
    pub entry_point: String,
    pub working_dir: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub proxy_path: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub desired_status: DesiredStatus,
}

impl Default for DesiredStatus {
    fn default() -> Self {
        DesiredStatus::Stopped
    }
}

fn default_rate_limit() -> u32 {
    100
}
fn default_timeout() -> u64 {
    30_000
}
fn default_health_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    pub name: String,
    pub entry_point: String,
    pub working_dir: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub proxy_path: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub entry_point: Option<String>,
    pub working_dir: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub proxy_path: Option<String>,
    pub rate_limit: Option<u32>,
    pub cache_ttl: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub auto_restart: Option<bool>,
    pub max_restarts: Option<u32>,
    pub health_check_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceRow {
    pub id: String,
    pub name: String,
    pub entry_point: String,
    pub working_dir: String,
    pub args_json: String,
    pub env_json: String,
    pub proxy_path: String,
    pub rate_limit: i64,
    pub cache_ttl: i64,
    pub timeout_ms: i64,
    pub auto_restart: bool,
    pub max_restarts: i64,
    pub health_check_interval_secs: i64,
    pub desired_status: String,
}

impl ServiceRow {
    pub fn into_definition(self) -> anyhow::Result<ServiceDefinition> {
        Ok(ServiceDefinition {
            id: self.id,
            name: self.name,
            entry_point: self.entry_point,
            working_dir: self.working_dir,
            args: serde_json::from_str(&self.args_json)?,
            env: serde_json::from_str(&self.env_json)?,
            proxy_path: self.proxy_path,
            rate_limit: self.rate_limit as u32,
            cache_ttl: self.cache_ttl as u64,
            timeout_ms: self.timeout_ms as u64,
            auto_restart: self.auto_restart,
            max_restarts: self.max_restarts as u32,
            health_check_interval_secs: self.health_check_interval_secs as u64,
            desired_status: DesiredStatus::parse(&self.desired_status),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: String,
    pub name: String,
    pub hash: String,
    pub active: bool,
    pub created_at: String,
    pub last_used_at: Option<String>,
}
