//! In-memory backends — the default for tests and single-process
//! deployments.
//!
//! No periodic timers: the rate-limit store cleans up lazily when it
//! grows past a threshold, which keeps it safe on serverless platforms
//! that freeze background tasks.

use async_trait::async_trait;
use manifold_core::store::{
    AuditEntry, AuditStore, Bucket, GENESIS_HASH, RateLimitStore, StoreError, compute_entry_hash,
};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::now_ms;

/// Evict expired buckets once the map grows past this many keys.
const CLEANUP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    bucket: Bucket,
    expires_at_ms: u64,
}

/// Mutex'd map of fixed-window buckets with lazy cleanup.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<HashMap<String, StoredBucket>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cleanup_if_needed(buckets: &mut HashMap<String, StoredBucket>, now: u64) {
        if buckets.len() > CLEANUP_THRESHOLD {
            buckets.retain(|_, stored| stored.expires_at_ms > now);
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let now = now_ms();
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(buckets
            .get(key)
            .filter(|stored| stored.expires_at_ms > now)
            .map(|stored| stored.bucket))
    }

    async fn set(&self, key: &str, bucket: Bucket, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let now = now_ms();
        let expires_at_ms = ttl_ms.map(|ttl| now + ttl).unwrap_or(bucket.reset_at_ms);
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Self::cleanup_if_needed(&mut buckets, now);
        buckets.insert(key.to_string(), StoredBucket { bucket, expires_at_ms });
        Ok(())
    }

    async fn increment(&self, key: &str, window_ms: u64) -> Result<Bucket, StoreError> {
        let now = now_ms();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Self::cleanup_if_needed(&mut buckets, now);

        let stored = buckets
            .entry(key.to_string())
            .and_modify(|stored| {
                if stored.bucket.reset_at_ms <= now {
                    stored.bucket = Bucket {
                        count: 1,
                        reset_at_ms: now + window_ms,
                    };
                    stored.expires_at_ms = now + window_ms;
                } else {
                    stored.bucket.count += 1;
                }
            })
            .or_insert_with(|| StoredBucket {
                bucket: Bucket {
                    count: 1,
                    reset_at_ms: now + window_ms,
                },
                expires_at_ms: now + window_ms,
            });
        Ok(stored.bucket)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Ordered in-memory audit chain with a request-id index.
///
/// One lock covers the read-tail / hash / push trio, which makes appends
/// linearizable without a writer task.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    inner: Mutex<AuditInner>,
    secret: Option<String>,
}

#[derive(Debug, Default)]
struct AuditInner {
    entries: Vec<AuditEntry>,
    by_request: HashMap<String, usize>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// HMAC mode: chain hashes are keyed with `secret`.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(AuditInner::default()),
            secret: Some(secret.into()),
        }
    }

    /// Snapshot of the full chain, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let previous = inner
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        entry.previous_hash = previous.clone();
        entry.hash = compute_entry_hash(&entry, &previous, self.secret.as_deref())?;

        let index = inner.entries.len();
        inner.by_request.insert(entry.request_id.clone(), index);
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    async fn last_hash(&self) -> Result<String, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string()))
    }

    async fn get(&self, request_id: &str) -> Result<Option<AuditEntry>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .by_request
            .get(request_id)
            .and_then(|&i| inner.entries.get(i))
            .cloned())
    }

    async fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.entries.len().saturating_sub(limit);
        Ok(inner.entries[skip..].to_vec())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::store::{AuditCategory, AuditStatus, RiskLevel, verify_chain};
    use std::sync::Arc;

    fn entry(request_id: &str) -> AuditEntry {
        AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            hash: String::new(),
            previous_hash: String::new(),
            request_id: request_id.to_string(),
            method: "POST".into(),
            path: "/api/v1/execute".into(),
            protocol: "openapi".into(),
            tenant_id: "tenant-abc".into(),
            user_id: "alice".into(),
            roles: vec!["user".into()],
            api_version: "v1".into(),
            client_type: None,
            trace_id: None,
            span_id: None,
            action: "registry.listEngines()".into(),
            category: AuditCategory::Write,
            risk_level: RiskLevel::Medium,
            status: AuditStatus::Success,
            status_code: Some(200),
            error_code: None,
            duration_ms: Some(3),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn increment_counts_within_window() {
        let store = MemoryRateLimitStore::new();
        let first = store.increment("rl:tenant-a:burst", 60_000).await.unwrap();
        assert_eq!(first.count, 1);
        let second = store.increment("rl:tenant-a:burst", 60_000).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(first.reset_at_ms, second.reset_at_ms);

        // different keys are independent
        let other = store.increment("rl:tenant-b:burst", 60_000).await.unwrap();
        assert_eq!(other.count, 1);
    }

    #[tokio::test]
    async fn expired_bucket_restarts_the_window() {
        let store = MemoryRateLimitStore::new();
        store
            .set(
                "rl:t:burst",
                Bucket {
                    count: 99,
                    reset_at_ms: now_ms().saturating_sub(5),
                },
                None,
            )
            .await
            .unwrap();
        let bucket = store.increment("rl:t:burst", 1_000).await.unwrap();
        assert_eq!(bucket.count, 1);
        assert!(bucket.reset_at_ms > now_ms().saturating_sub(1));
    }

    #[tokio::test]
    async fn get_hides_expired_buckets_and_delete_removes() {
        let store = MemoryRateLimitStore::new();
        store
            .set(
                "rl:t:w",
                Bucket {
                    count: 1,
                    reset_at_ms: now_ms() + 60_000,
                },
                Some(60_000),
            )
            .await
            .unwrap();
        assert!(store.get("rl:t:w").await.unwrap().is_some());

        store.delete("rl:t:w").await.unwrap();
        assert!(store.get("rl:t:w").await.unwrap().is_none());

        store
            .set(
                "rl:t:stale",
                Bucket {
                    count: 1,
                    reset_at_ms: 1,
                },
                Some(0),
            )
            .await
            .unwrap();
        assert!(store.get("rl:t:stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audit_appends_chain_from_genesis() {
        let store = MemoryAuditStore::new();
        assert_eq!(store.last_hash().await.unwrap(), GENESIS_HASH);

        let first = store.append(entry("r1")).await.unwrap();
        assert_eq!(first.previous_hash, GENESIS_HASH);
        let second = store.append(entry("r2")).await.unwrap();
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(store.last_hash().await.unwrap(), second.hash);

        assert!(verify_chain(&store.entries(), None));
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn audit_lookup_by_request_id() {
        let store = MemoryAuditStore::new();
        store.append(entry("r1")).await.unwrap();
        store.append(entry("r2")).await.unwrap();

        let found = store.get("r2").await.unwrap().unwrap();
        assert_eq!(found.request_id, "r2");
        assert!(store.get("r404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tail_returns_newest_entries_oldest_first() {
        let store = MemoryAuditStore::new();
        for i in 0..5 {
            store.append(entry(&format!("r{i}"))).await.unwrap();
        }
        let tail = store.tail(2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].request_id, "r3");
        assert_eq!(tail[1].request_id, "r4");
    }

    #[tokio::test]
    async fn concurrent_appends_stay_linearizable() {
        let store = Arc::new(MemoryAuditStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(entry(&format!("r{i}"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 32);
        assert!(verify_chain(&store.entries(), None));
    }

    #[tokio::test]
    async fn keyed_chain_verifies_only_with_secret() {
        let store = MemoryAuditStore::with_secret("audit-key");
        store.append(entry("r1")).await.unwrap();
        assert!(verify_chain(&store.entries(), Some("audit-key")));
        assert!(!verify_chain(&store.entries(), None));
    }
}
