//! Fixed-window rate limiter, keyed by (service id, client key).
//!
//! Each window is a simple counter that resets when the wall clock crosses
//! into the next window boundary — no sliding average, no token bucket.
//! A background sweep evicts windows that have gone idle so the map does
//! not grow without bound as clients come and go.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const WINDOW_SECS: i64 = 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const IDLE_EVICTION_SECS: i64 = 600;

#[derive(Debug, Clone)]
struct WindowState {
    window_start: i64,
    count: u32,
    last_seen: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<(String, String), WindowState>>>,
}

pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
    /// Absolute time the current window ends, in milliseconds — the `reset`
    /// header value the spec requires alongside `limit`/`remaining`.
    pub reset_at_ms: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the background eviction sweep. Call once at startup.
    pub fn spawn_sweeper(&self) {
        let windows = self.windows.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let now = Utc::now().timestamp();
                windows
                    .lock()
                    .await
                    .retain(|_, state| now - state.last_seen < IDLE_EVICTION_SECS);
            }
        });
    }

    /// Check and record one request against `limit` requests per 60s window.
    pub async fn check(&self, service_id: &str, client_key: &str, limit: u32) -> Decision {
        let now = Utc::now().timestamp();
        let window_start = now - (now % WINDOW_SECS);
        let key = (service_id.to_string(), client_key.to_string());

        let mut windows = self.windows.lock().await;
        let state = windows.entry(key).or_insert(WindowState {
            window_start,
            count: 0,
            last_seen: now,
        });

        if state.window_start != window_start {
            state.window_start = window_start;
            state.count = 0;
        }
        state.last_seen = now;

        let reset_at_ms = ((window_start + WINDOW_SECS) * 1000).max(0) as u64;

        if state.count >= limit {
            let retry_after = (window_start + WINDOW_SECS - now).max(0) as u64;
            return Decision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_secs: retry_after,
                reset_at_ms,
            };
        }

        state.count += 1;
        Decision {
            allowed: true,
            limit,
            remaining: limit - state.count,
            retry_after_secs: 0,
            reset_at_ms,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
