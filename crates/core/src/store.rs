//! Pluggable store contracts: rate-limit buckets and the hash-chained
//! audit trail.
//!
//! Implementations live in `manifold-stores`. The chain rule is defined
//! here so every backend hashes identically: an entry's hash covers its
//! canonical encoding (minus the `hash` field) concatenated with the
//! previous entry's hash, with the literal `genesis` seeding the chain.

use crate::canonical;
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Seed value for the first entry's `previous_hash`.
pub const GENESIS_HASH: &str = "genesis";

/// Store backend failures. Surfaced to clients as `INTERNAL_ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::internal(err.to_string())
    }
}

/// A fixed-window rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub count: u64,
    pub reset_at_ms: u64,
}

/// Counter storage for the rate-limiting stages.
///
/// `increment` must be atomic per key: two concurrent increments on the
/// same key observe distinct counts.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError>;
    async fn set(&self, key: &str, bucket: Bucket, ttl_ms: Option<u64>) -> Result<(), StoreError>;
    async fn increment(&self, key: &str, window_ms: u64) -> Result<Bucket, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Audit classification by operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    Read,
    Write,
    Delete,
    Admin,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Read => "read",
            AuditCategory::Write => "write",
            AuditCategory::Delete => "delete",
            AuditCategory::Admin => "admin",
            AuditCategory::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Success,
    Failure,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
            AuditStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One immutable link in the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Filled by the store at append time.
    pub hash: String,
    /// Filled by the store at append time; `genesis` for the first entry.
    pub previous_hash: String,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub tenant_id: String,
    pub user_id: String,
    pub roles: Vec<String>,
    pub api_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub action: String,
    pub category: AuditCategory,
    pub risk_level: RiskLevel,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Hash an entry against the previous chain tail.
///
/// The `hash` field is excluded from the encoding; `previous_hash` is
/// part of it and must already be set to `previous`.
pub fn compute_entry_hash(
    entry: &AuditEntry,
    previous: &str,
    secret: Option<&str>,
) -> Result<String, StoreError> {
    let mut value = serde_json::to_value(entry)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("hash");
    }
    let mut payload = canonical::canonical_json(&value);
    payload.push_str(previous);
    Ok(match secret {
        Some(s) => canonical::hmac_sha256_hex(s.as_bytes(), payload.as_bytes()),
        None => canonical::sha256_hex(payload.as_bytes()),
    })
}

/// Recompute the chain from genesis and compare. Any tampered, deleted,
/// or reordered entry breaks the walk.
pub fn verify_chain(entries: &[AuditEntry], secret: Option<&str>) -> bool {
    let mut previous = GENESIS_HASH.to_string();
    for entry in entries {
        if entry.previous_hash != previous {
            return false;
        }
        match compute_entry_hash(entry, &previous, secret) {
            Ok(expected) if expected == entry.hash => previous = entry.hash.clone(),
            _ => return false,
        }
    }
    true
}

/// Append-only audit trail.
///
/// `append` finalizes the chain fields (`previous_hash` from the current
/// tail, then `hash`) and commits — the whole trio must be serialized
/// against concurrent appends, via a store-side lock or transaction.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<AuditEntry, StoreError>;
    /// Hash of the newest entry, or [`GENESIS_HASH`] when empty.
    async fn last_hash(&self) -> Result<String, StoreError>;
    async fn get(&self, request_id: &str) -> Result<Option<AuditEntry>, StoreError>;
    /// Newest `limit` entries, oldest first.
    async fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError>;
    async fn len(&self) -> Result<usize, StoreError>;
}
