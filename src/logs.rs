//! Bounded ring buffer of recent log lines per service, with a broadcast
//! channel for live streaming (Management Surface `/logs` and `/logs/stream`).

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const RING_CAPACITY: usize = 500;
const STREAM_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

struct Shared {
    ring: Mutex<VecDeque<LogLine>>,
    tx: broadcast::Sender<LogLine>,
}

#[derive(Clone)]
pub struct LogSink {
    shared: Arc<Shared>,
}

impl LogSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
                tx,
            }),
        }
    }

    /// A cheaply-cloneable handle sharing the same ring buffer and stream,
    /// for background tasks (stderr forwarding, unparsed-line logging) that
    /// need to push without holding a reference back to the owner.
    pub fn clone_handle(&self) -> Self {
        self.clone()
    }

    pub async fn push(&self, level: &str, message: impl Into<String>) {
        let line = LogLine {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.into(),
        };
        {
            let mut ring = self.shared.ring.lock().await;
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        let _ = self.shared.tx.send(line);
    }

    pub async fn recent(&self, limit: usize) -> Vec<LogLine> {
        let ring = self.shared.ring.lock().await;
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.shared.tx.subscribe()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_caps_at_capacity() {
        let sink = LogSink::new();
        for i in 0..(RING_CAPACITY + 10) {
            sink.push("info", format!("line {i}")).await;
        }
        let recent = sink.recent(RING_CAPACITY + 10).await;
        assert_eq!(recent.len(), RING_CAPACITY);
        assert_eq!(recent.last().unwrap().message, format!("line {}", RING_CAPACITY + 9));
    }

    #[tokio::test]
    async fn recent_respects_limit_and_order() {
        let sink = LogSink::new();
        for i in 0..5 {
            sink.push("info", format!("line {i}")).await;
        }
        let recent = sink.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "line 3");
        assert_eq!(recent[1].message, "line 4");
    }
}
