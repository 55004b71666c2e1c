pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod framer;
pub mod logs;
pub mod management;
pub mod metrics;
pub mod process_manager;
pub mod proxy;
pub mod rate_limiter;
pub mod registry;
pub mod rpc;
pub mod supervisor;

use collaborators::{CertificateProvider, ExternalUrlProvider, NoCertificateProvider, NoExternalUrlProvider};
use config::Config;
use metrics::Metrics;
use process_manager::ProcessManager;
use rate_limiter::RateLimiter;
use registry::Registry;
use std::sync::Arc;

/// Shared state handed to every HTTP handler and background task.
pub struct AppState {
    pub config: Config,
    pub registry: Registry,
    pub process_manager: ProcessManager,
    pub rate_limiter: RateLimiter,
    pub cache: cache::ResponseCache,
    pub metrics: Arc<Metrics>,
    pub certificate_provider: Box<dyn CertificateProvider>,
    pub external_url_provider: Box<dyn ExternalUrlProvider>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(config: Config, registry: Registry) -> Self {
        let metrics = Arc::new(Metrics::new());
        let process_manager = ProcessManager::new(registry.clone(), metrics.clone());
        Self {
            config,
            registry,
            process_manager,
            rate_limiter: RateLimiter::new(),
            cache: cache::ResponseCache::new(),
            metrics,
            certificate_provider: Box::new(NoCertificateProvider),
            external_url_provider: Box::new(NoExternalUrlProvider),
            started_at: std::time::Instant::now(),
        }
    }
}
