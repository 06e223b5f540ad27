//! Store implementations for the Manifold gateway.
//!
//! The contracts live in `manifold-core::store`; this crate provides the
//! reference backends:
//!
//! - [`memory::MemoryRateLimitStore`] / [`memory::MemoryAuditStore`] —
//!   in-process, serverless-safe (no background timers)
//! - [`redis_store::RedisRateLimitStore`] — fixed-window counters with
//!   TTL on an external key-value service (feature `redis`)
//! - [`sqlite::SqliteAuditStore`] — durable audit chain on SQLite via
//!   sqlx (feature `sqlite`, default)

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis_store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryAuditStore, MemoryRateLimitStore};

#[cfg(feature = "redis")]
pub use redis_store::RedisRateLimitStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditStore;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
