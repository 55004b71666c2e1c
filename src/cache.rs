//! Response cache — content-addressed by a SHA-256 fingerprint of the
//! canonicalized request body, with per-service TTL expiry.
//!
//! Canonicalization serializes `serde_json::Value` with sorted object keys
//! (via `BTreeMap` round-trip) so two requests that differ only in key
//! order still hash identically.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    response: Value,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn spawn_sweeper(&self) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let now = Instant::now();
                entries.lock().await.retain(|_, entry| entry.expires_at > now);
            }
        });
    }

    /// Canonical fingerprint of a request body, scoped to the service so two
    /// services never share a cache entry even for byte-identical bodies.
    pub fn fingerprint(service_id: &str, body: &Value) -> String {
        let canonical = canonicalize(body);
        let mut hasher = Sha256::new();
        hasher.update(service_id.as_bytes());
        hasher.update(b":");
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, fingerprint: &str) -> Option<Value> {
        let entries = self.entries.lock().await;
        let entry = entries.get(fingerprint)?;
        if entry.expires_at > Instant::now() {
            Some(entry.response.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, fingerprint: String, response: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.insert(
            fingerprint,
            Entry {
                response,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-serialize with `BTreeMap` so object keys sort deterministically,
/// independent of the original field order in the source JSON.
fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let a = serde_json::json!({"method": "tools/call", "params": {"x": 1, "y": 2}});
        let b = serde_json::json!({"params": {"y": 2, "x": 1}, "method": "tools/call"});
        assert_eq!(ResponseCache::fingerprint("svc", &a), ResponseCache::fingerprint("svc", &b));
    }

    #[test]
    fn fingerprint_differs_across_services() {
        let body = serde_json::json!({"method": "ping"});
        assert_ne!(
            ResponseCache::fingerprint("svc-a", &body),
            ResponseCache::fingerprint("svc-b", &body)
        );
    }

    #[tokio::test]
    async fn put_then_get_round_trips_until_expiry() {
        let cache = ResponseCache::new();
        let fp = ResponseCache::fingerprint("svc", &serde_json::json!({"m": 1}));
        cache.put(fp.clone(), serde_json::json!({"ok": true}), Duration::from_millis(50)).await;
        assert!(cache.get(&fp).await.is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_never_caches() {
        let cache = ResponseCache::new();
        let fp = ResponseCache::fingerprint("svc", &serde_json::json!({"m": 1}));
        cache.put(fp.clone(), serde_json::json!({"ok": true}), Duration::ZERO).await;
        assert!(cache.get(&fp).await.is_none());
    }
}
