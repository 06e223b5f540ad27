//! Durable audit backend on SQLite via sqlx.
//!
//! The pool is capped at one connection: the read-tail/insert pair runs
//! inside a transaction on that single connection, which serializes
//! appends and keeps the chain linearizable without advisory locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manifold_core::store::{
    AuditCategory, AuditEntry, AuditStatus, AuditStore, GENESIS_HASH, RiskLevel, StoreError,
    compute_entry_hash,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

/// SQLite-backed audit chain.
pub struct SqliteAuditStore {
    pool: SqlitePool,
    secret: Option<String>,
}

impl SqliteAuditStore {
    /// Open (or create) the database at `path`. Pass `":memory:"` for an
    /// ephemeral database in tests.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Backend(format!("invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to open SQLite: {e}")))?;

        let store = Self { pool, secret: None };
        store.run_migrations().await?;
        info!(path, "SQLite audit store initialized");
        Ok(store)
    }

    /// HMAC mode: chain hashes are keyed with `secret`.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL,
                request_id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                hash TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                roles TEXT NOT NULL,
                api_version TEXT NOT NULL,
                client_type TEXT,
                trace_id TEXT,
                span_id TEXT,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                protocol TEXT NOT NULL,
                action TEXT NOT NULL,
                category TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                status TEXT NOT NULL,
                status_code INTEGER,
                error_code TEXT,
                duration_ms INTEGER,
                metadata TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_audit_request_id ON audit_entries(request_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_tenant ON audit_entries(tenant_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_entries(timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_audit_tenant_timestamp ON audit_entries(tenant_id, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_audit_hash ON audit_entries(hash)",
            "CREATE INDEX IF NOT EXISTS idx_audit_category ON audit_entries(category)",
            "CREATE INDEX IF NOT EXISTS idx_audit_risk_level ON audit_entries(risk_level)",
            "CREATE INDEX IF NOT EXISTS idx_audit_status ON audit_entries(status)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        Ok(())
    }

    /// Load the full chain, oldest first.
    pub async fn all(&self) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM audit_entries ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(row_to_entry).collect()
    }
}

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, StoreError> {
    let timestamp: String = row.get("timestamp");
    let roles: String = row.get("roles");
    let metadata: Option<String> = row.get("metadata");
    let category: String = row.get("category");
    let risk_level: String = row.get("risk_level");
    let status: String = row.get("status");

    Ok(AuditEntry {
        id: row.get("entry_id"),
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| StoreError::Backend(format!("bad timestamp in row: {e}")))?
            .with_timezone(&Utc),
        hash: row.get("hash"),
        previous_hash: row.get("previous_hash"),
        request_id: row.get("request_id"),
        method: row.get("method"),
        path: row.get("path"),
        protocol: row.get("protocol"),
        tenant_id: row.get("tenant_id"),
        user_id: row.get("user_id"),
        roles: serde_json::from_str(&roles)?,
        api_version: row.get("api_version"),
        client_type: row.get("client_type"),
        trace_id: row.get("trace_id"),
        span_id: row.get("span_id"),
        action: row.get("action"),
        category: AuditCategory::parse(&category)
            .ok_or_else(|| StoreError::Backend(format!("unknown category {category:?}")))?,
        risk_level: RiskLevel::parse(&risk_level)
            .ok_or_else(|| StoreError::Backend(format!("unknown risk level {risk_level:?}")))?,
        status: AuditStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown status {status:?}")))?,
        status_code: row.get::<Option<i64>, _>("status_code").map(|v| v as u16),
        error_code: row.get("error_code"),
        duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let previous: String =
            sqlx::query_scalar("SELECT hash FROM audit_entries ORDER BY id DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?
                .unwrap_or_else(|| GENESIS_HASH.to_string());

        entry.previous_hash = previous.clone();
        entry.hash = compute_entry_hash(&entry, &previous, self.secret.as_deref())?;

        sqlx::query(
            "INSERT INTO audit_entries (
                entry_id, request_id, timestamp, hash, previous_hash,
                tenant_id, user_id, roles, api_version, client_type,
                trace_id, span_id, method, path, protocol, action,
                category, risk_level, status, status_code, error_code,
                duration_ms, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.request_id)
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.hash)
        .bind(&entry.previous_hash)
        .bind(&entry.tenant_id)
        .bind(&entry.user_id)
        .bind(serde_json::to_string(&entry.roles)?)
        .bind(&entry.api_version)
        .bind(&entry.client_type)
        .bind(&entry.trace_id)
        .bind(&entry.span_id)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(&entry.protocol)
        .bind(&entry.action)
        .bind(entry.category.as_str())
        .bind(entry.risk_level.as_str())
        .bind(entry.status.as_str())
        .bind(entry.status_code.map(|v| v as i64))
        .bind(&entry.error_code)
        .bind(entry.duration_ms.map(|v| v as i64))
        .bind(
            entry
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(entry)
    }

    async fn last_hash(&self) -> Result<String, StoreError> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM audit_entries ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(hash.unwrap_or_else(|| GENESIS_HASH.to_string()))
    }

    async fn get(&self, request_id: &str) -> Result<Option<AuditEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM audit_entries WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM (
                SELECT * FROM audit_entries ORDER BY id DESC LIMIT ?
            ) ORDER BY id ASC",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(count as usize)
    }
}
