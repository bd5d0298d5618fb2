use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CounterStore;
use crate::error::AppResult;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at: Instant,
}

/// In-process counters for tests and single-node development.
///
/// Expiry is evaluated lazily on access; nothing sweeps stale entries.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a counter, e.g. to start a test just below a quota.
    pub async fn set(&self, key: &str, value: i64, ttl: Duration) {
        self.counters.lock().await.insert(
            key.to_string(),
            Counter {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Number of live counters.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.counters
            .lock()
            .await
            .values()
            .filter(|c| c.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> AppResult<i64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;

        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: now + ttl,
        });
        if counter.expires_at <= now {
            counter.value = 0;
        }
        counter.value += 1;
        counter.expires_at = now + ttl;

        Ok(counter.value)
    }

    async fn current(&self, key: &str) -> AppResult<i64> {
        let now = Instant::now();
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map_or(0, |c| c.value))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
