//! Expiring integer counters backing every quota window.
//!
//! The rate limit engine only ever needs two things from the shared store:
//! bump a counter and make sure it expires, or peek at its current value.
//! [`CounterStore`] captures exactly that so the engine can run against
//! Redis in production and an in-process map in tests.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;

pub use self::memory::MemoryCounterStore;
pub use self::redis_store::RedisCounterStore;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` by one and (re)arm its expiry, returning the
    /// post-increment value. Missing keys start at zero.
    async fn increment(&self, key: &str, ttl: Duration) -> AppResult<i64>;

    /// Current value of `key`, zero when missing or expired.
    async fn current(&self, key: &str) -> AppResult<i64>;

    /// Round-trip to the backing store.
    async fn ping(&self) -> AppResult<()>;
}
