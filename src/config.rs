//! Configuration — CLI / env vars layered over `{data_dir}/config.toml`,
//! layered over built-in defaults. Priority: CLI/env > TOML > default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4700;
const DEFAULT_DEFAULT_RATE_LIMIT: u32 = 100;
const DEFAULT_DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    default_rate_limit: Option<u32>,
    default_timeout_ms: Option<u64>,
    require_api_key: Option<bool>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the reverse proxy and management surface listen on.
    pub port: u16,
    /// Directory holding the SQLite registry database and `config.toml`.
    pub data_dir: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive string.
    pub log: String,
    /// Default per-service rate limit used when a new service omits one.
    pub default_rate_limit: u32,
    /// Default per-service request timeout used when a new service omits one.
    pub default_timeout_ms: u64,
    /// Whether management endpoints require `X-API-Key`. Disabling this is
    /// only appropriate for local development.
    pub require_api_key: bool,
    /// `DATABASE_URL` bootstrap env var — overrides the default
    /// `{data_dir}/mcpd.db` sqlite location when set.
    pub database_url: Option<String>,
    /// `ENV` bootstrap env var — deployment environment name
    /// (`development`/`production`/...), read once at startup.
    pub environment: String,
    /// `INITIAL_SETUP` bootstrap env var. The setup wizard itself is out of
    /// scope here; this is read and logged so an operator relying on it from
    /// the original deployment flow isn't met with silence.
    pub initial_setup: bool,
}

impl Config {
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let default_rate_limit = toml.default_rate_limit.unwrap_or(DEFAULT_DEFAULT_RATE_LIMIT);
        let default_timeout_ms = toml.default_timeout_ms.unwrap_or(DEFAULT_DEFAULT_TIMEOUT_MS);
        let require_api_key = std::env::var("MCPD_REQUIRE_API_KEY")
            .ok()
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .or(toml.require_api_key)
            .unwrap_or(true);

        // Bootstrap env vars — read once here, never from config.toml: they
        // describe how to find/initialize the store itself, so they can't
        // live inside it.
        let database_url = std::env::var("DATABASE_URL").ok();
        let environment = std::env::var("ENV").unwrap_or_else(|_| "development".to_string());
        let initial_setup = std::env::var("INITIAL_SETUP")
            .ok()
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            port,
            data_dir,
            log,
            default_rate_limit,
            default_timeout_ms,
            require_api_key,
            database_url,
            environment,
            initial_setup,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MCPD_DATA_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("mcpd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("mcpd");
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("mcpd");
        }
    }
    PathBuf::from(".mcpd")
}
