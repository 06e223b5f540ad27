//! Redis-backed rate limiting — fixed-window counters with TTL.
//!
//! Each key holds a plain counter; `PEXPIRE ... NX` arms the window on
//! first increment so the reset time is shared by every process pointing
//! at the same Redis.

use async_trait::async_trait;
use manifold_core::store::{Bucket, RateLimitStore, StoreError};
use redis::aio::ConnectionManager;

use crate::now_ms;

/// Fixed-window rate-limit store on an external Redis.
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    /// Namespace prepended to every key.
    prefix: String,
}

impl RedisRateLimitStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(to_store_error)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(to_store_error)?;
        Ok(Self {
            conn,
            prefix: "manifold".into(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn to_store_error(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&full_key)
            .cmd("PTTL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(to_store_error)?;
        Ok(count.map(|count| Bucket {
            count,
            reset_at_ms: now_ms() + ttl_ms.max(0) as u64,
        }))
    }

    async fn set(&self, key: &str, bucket: Bucket, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let full_key = self.full_key(key);
        let now = now_ms();
        let ttl = ttl_ms.unwrap_or_else(|| bucket.reset_at_ms.saturating_sub(now).max(1));
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&full_key)
            .arg(bucket.count)
            .arg("PX")
            .arg(ttl)
            .query_async(&mut conn)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    async fn increment(&self, key: &str, window_ms: u64) -> Result<Bucket, StoreError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        // INCR then arm the TTL only when none exists, so the window is
        // anchored at the first hit.
        let (count, _armed, ttl_ms): (u64, i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&full_key)
            .cmd("PEXPIRE")
            .arg(&full_key)
            .arg(window_ms)
            .arg("NX")
            .cmd("PTTL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(to_store_error)?;

        let remaining = if ttl_ms > 0 { ttl_ms as u64 } else { window_ms };
        Ok(Bucket {
            count,
            reset_at_ms: now_ms() + remaining,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }
}
