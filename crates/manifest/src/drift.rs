//! Drift detection for the live manifest.
//!
//! The guard snapshots the boot manifest (minus signature) as its
//! baseline. Any later manifest value is checked against that snapshot;
//! differences are classified by which policy areas they touch.

use crate::schema::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;

/// Policy areas monitored for drift, in severity-classification order.
const MONITORED_FIELDS: &[&str] = &[
    "enforcement",
    "security",
    "protocols",
    "rate_limits",
    "cors",
    "versioning",
    "required_headers",
    "payload_limits",
    "error_codes",
    "timeouts",
    "retry",
    "version",
];

const CRITICAL_FIELDS: &[&str] = &["enforcement", "security"];
const HIGH_FIELDS: &[&str] = &["protocols", "rate_limits"];
const MEDIUM_FIELDS: &[&str] = &["cors", "versioning", "required_headers"];

/// How bad a detected drift is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Top-level keys that differ between baseline and current.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

/// The result of one drift check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub has_drift: bool,
    pub expected_signature: String,
    pub actual_signature: String,
    pub diff: DriftDiff,
    /// Monitored fields among the changed keys.
    pub changed_fields: Vec<String>,
    pub severity: DriftSeverity,
    /// `<FIELD>_CHANGED` per changed monitored field.
    pub reason_codes: Vec<String>,
}

/// One approval/rejection decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftHistoryEntry {
    pub at: DateTime<Utc>,
    pub by: String,
    pub action: DriftAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub severity: DriftSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftAction {
    Approved,
    Rejected,
}

/// Maximum history entries kept in memory.
const MAX_HISTORY: usize = 5_000;

/// Fatal drift enforcement failure.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    #[error("drift shield tripped: {severity:?} drift in {fields:?}")]
    ShieldTripped {
        severity: DriftSeverity,
        fields: Vec<String>,
    },

    #[error("manifest serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Holds the deep-cloned baseline and evaluates candidate manifests
/// against it.
pub struct DriftGuard {
    /// Baseline manifest value, signature field removed.
    baseline: RwLock<Value>,
    secret: Option<String>,
    /// Decision log (bounded to MAX_HISTORY entries).
    history: RwLock<Vec<DriftHistoryEntry>>,
}

impl DriftGuard {
    pub fn new(baseline: &Manifest, secret: Option<&str>) -> Result<Self, DriftError> {
        Ok(Self {
            baseline: RwLock::new(strip_signature(baseline)?),
            secret: secret.map(String::from),
            history: RwLock::new(Vec::new()),
        })
    }

    /// Compare a candidate manifest against the baseline.
    pub fn check(&self, current: &Manifest) -> Result<DriftReport, DriftError> {
        let current_value = strip_signature(current)?;
        let baseline = self.baseline.read().unwrap_or_else(|e| e.into_inner());

        let expected = manifold_core::canonical::signature(&baseline, self.secret.as_deref());
        let actual = manifold_core::canonical::signature(&current_value, self.secret.as_deref());

        if expected == actual {
            return Ok(DriftReport {
                has_drift: false,
                expected_signature: expected,
                actual_signature: actual,
                diff: DriftDiff::default(),
                changed_fields: Vec::new(),
                severity: DriftSeverity::None,
                reason_codes: Vec::new(),
            });
        }

        let diff = diff_top_level(&baseline, &current_value);
        let mut changed: Vec<&str> = Vec::new();
        for field in MONITORED_FIELDS {
            let touched = diff.added.iter().any(|k| k == field)
                || diff.removed.iter().any(|k| k == field)
                || diff.modified.iter().any(|k| k == field);
            if touched {
                changed.push(field);
            }
        }

        let severity = classify(&changed);
        let reason_codes = changed
            .iter()
            .map(|f| format!("{}_CHANGED", f.to_ascii_uppercase()))
            .collect();

        Ok(DriftReport {
            has_drift: true,
            expected_signature: expected,
            actual_signature: actual,
            diff,
            changed_fields: changed.iter().map(|s| s.to_string()).collect(),
            severity,
            reason_codes,
        })
    }

    /// Accept a new manifest: record the decision and replace the
    /// baseline with a deep clone of the new value.
    pub fn approve(
        &self,
        new: &Manifest,
        by: &str,
        reason: Option<&str>,
    ) -> Result<DriftReport, DriftError> {
        let report = self.check(new)?;
        self.push_history(by, DriftAction::Approved, reason, report.severity);
        *self.baseline.write().unwrap_or_else(|e| e.into_inner()) = strip_signature(new)?;
        tracing::info!(by, severity = ?report.severity, "Manifest drift approved");
        Ok(report)
    }

    /// Record a rejection without touching the baseline.
    pub fn reject(
        &self,
        current: &Manifest,
        by: &str,
        reason: &str,
    ) -> Result<DriftReport, DriftError> {
        let report = self.check(current)?;
        self.push_history(by, DriftAction::Rejected, Some(reason), report.severity);
        tracing::warn!(by, reason, severity = ?report.severity, "Manifest drift rejected");
        Ok(report)
    }

    /// Fail hard on high/critical drift.
    pub fn enforce(&self, current: &Manifest) -> Result<DriftReport, DriftError> {
        let report = self.check(current)?;
        if matches!(report.severity, DriftSeverity::High | DriftSeverity::Critical) {
            tracing::error!(
                severity = ?report.severity,
                fields = ?report.changed_fields,
                "Drift shield tripped"
            );
            return Err(DriftError::ShieldTripped {
                severity: report.severity,
                fields: report.changed_fields,
            });
        }
        Ok(report)
    }

    pub fn history(&self) -> Vec<DriftHistoryEntry> {
        self.history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push_history(
        &self,
        by: &str,
        action: DriftAction,
        reason: Option<&str>,
        severity: DriftSeverity,
    ) {
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        if history.len() >= MAX_HISTORY {
            history.drain(..MAX_HISTORY / 10);
        }
        history.push(DriftHistoryEntry {
            at: Utc::now(),
            by: by.to_string(),
            action,
            reason: reason.map(String::from),
            severity,
        });
    }
}

fn strip_signature(manifest: &Manifest) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(manifest)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("signature");
    }
    Ok(value)
}

fn diff_top_level(baseline: &Value, current: &Value) -> DriftDiff {
    let mut diff = DriftDiff::default();
    let (Some(base_map), Some(cur_map)) = (baseline.as_object(), current.as_object()) else {
        return diff;
    };
    for key in cur_map.keys() {
        if !base_map.contains_key(key) {
            diff.added.push(key.clone());
        }
    }
    for (key, base_value) in base_map {
        match cur_map.get(key) {
            None => diff.removed.push(key.clone()),
            Some(cur_value) if cur_value != base_value => diff.modified.push(key.clone()),
            Some(_) => {}
        }
    }
    diff
}

fn classify(changed: &[&str]) -> DriftSeverity {
    if changed.iter().any(|f| CRITICAL_FIELDS.contains(f)) {
        DriftSeverity::Critical
    } else if changed.iter().any(|f| HIGH_FIELDS.contains(f)) {
        DriftSeverity::High
    } else if changed.iter().any(|f| MEDIUM_FIELDS.contains(f)) {
        DriftSeverity::Medium
    } else {
        DriftSeverity::Low
    }
}
