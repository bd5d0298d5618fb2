use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::CounterStore;
use crate::error::AppResult;

/// Redis-backed counters. `INCR` and `EXPIRE` go out as one `MULTI/EXEC`
/// so a counter never exists without a TTL.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// Open a managed connection; it reconnects on its own after failures.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CounterStore` if the URL is invalid or the first
    /// connection cannot be established.
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to counter store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn current(&self, key: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
