//! In-process counters exposed as `GET /metrics` in Prometheus text format.
//! All counters are `AtomicU64` incremented inline — no external metrics
//! library needed for a handful of monotonic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub restarts_total: AtomicU64,
    pub started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            restarts_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc_requests_total(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited_total(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_restarts_total(&self) {
        self.restarts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let uptime = self.started_at.elapsed().as_secs();
        format!(
            "# HELP mcpd_requests_total Total proxied requests.\n\
             # TYPE mcpd_requests_total counter\n\
             mcpd_requests_total {}\n\
             # HELP mcpd_cache_hits_total Total cache hits.\n\
             # TYPE mcpd_cache_hits_total counter\n\
             mcpd_cache_hits_total {}\n\
             # HELP mcpd_cache_misses_total Total cache misses.\n\
             # TYPE mcpd_cache_misses_total counter\n\
             mcpd_cache_misses_total {}\n\
             # HELP mcpd_rate_limited_total Total requests rejected by rate limiting.\n\
             # TYPE mcpd_rate_limited_total counter\n\
             mcpd_rate_limited_total {}\n\
             # HELP mcpd_restarts_total Total supervised process restarts.\n\
             # TYPE mcpd_restarts_total counter\n\
             mcpd_restarts_total {}\n\
             # HELP mcpd_uptime_seconds Seconds since the daemon started.\n\
             # TYPE mcpd_uptime_seconds gauge\n\
             mcpd_uptime_seconds {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.rate_limited_total.load(Ordering::Relaxed),
            self.restarts_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_all_counters() {
        let metrics = Metrics::new();
        metrics.inc_requests_total();
        metrics.inc_cache_hits();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("mcpd_requests_total 1"));
        assert!(rendered.contains("mcpd_cache_hits_total 1"));
        assert!(rendered.contains("mcpd_cache_misses_total 0"));
    }
}
