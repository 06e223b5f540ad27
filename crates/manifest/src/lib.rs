//! Manifest construction, validation, and integrity for the Manifold
//! gateway.
//!
//! A process holds exactly one [`Manifest`] at boot, behind `Arc`.
//! Reloads are explicit: they build a *new* immutable value and hand it to
//! the [`DriftGuard`](drift::DriftGuard) for evaluation — nothing ever
//! mutates a live manifest.

pub mod drift;
pub mod merge;
pub mod schema;

pub use drift::{DriftGuard, DriftReport, DriftSeverity};
pub use merge::deep_merge;
pub use schema::{
    CorsPolicy, Environment, ErrorCodePolicy, FirewallPolicy, GraphqlLimits, Hardening, Manifest,
    PayloadLimits, ProtocolDescriptor, RateLimits, RequiredHeaders, RetryPolicy, SecurityPolicy,
    SocketLimits, Timeouts, VersionStrategy, VersioningPolicy, WindowLimit,
};

use manifold_core::ErrorCode;
use serde_json::Value;
use std::sync::Arc;

/// Fatal manifest construction failures.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest does not match the schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("manifest invariant violated: {0}")]
    Invariant(String),
}

/// Which deadline bucket a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutBucket {
    Default,
    LongRunning,
    Websocket,
    HealthCheck,
}

impl Manifest {
    /// Build a manifest: deep-merge `overrides` onto the baseline,
    /// validate schema and invariants, and compute the signature. The
    /// result is the process-wide immutable governance document.
    pub fn build(
        overrides: Option<&Value>,
        secret: Option<&str>,
    ) -> Result<Arc<Manifest>, ManifestError> {
        let base = serde_json::to_value(Manifest::baseline())?;
        let merged = match overrides {
            Some(patch) => merge::deep_merge(&base, patch),
            None => base,
        };
        let mut manifest: Manifest = serde_json::from_value(merged)?;
        manifest.check_invariants()?;
        manifest.signature = Some(manifest.compute_signature(secret)?);
        tracing::info!(
            name = %manifest.name,
            version = %manifest.version,
            env = %manifest.env.as_str(),
            signature = manifest.signature.as_deref().unwrap_or(""),
            "Manifest built"
        );
        Ok(Arc::new(manifest))
    }

    /// The `sha256-<hex>` signature over every field except `signature`.
    pub fn compute_signature(&self, secret: Option<&str>) -> Result<String, ManifestError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("signature");
        }
        Ok(manifold_core::canonical::signature(&value, secret))
    }

    /// Cross-field invariants. Violation is fatal at boot.
    pub fn check_invariants(&self) -> Result<(), ManifestError> {
        if self.security.require_tenant_id && !self.security.tenant_isolation_required {
            return Err(ManifestError::Invariant(
                "require_tenant_id requires tenant_isolation_required".into(),
            ));
        }
        if self.security.audit_mutations && !self.security.audit_trail_required {
            return Err(ManifestError::Invariant(
                "audit_mutations requires audit_trail_required".into(),
            ));
        }
        if self.enforcement.ai_firewall_required && !self.security.sanitize_inputs {
            return Err(ManifestError::Invariant(
                "ai_firewall_required requires sanitize_inputs".into(),
            ));
        }
        for (name, descriptor) in &self.protocols {
            if descriptor.enabled && !descriptor.path.starts_with('/') {
                return Err(ManifestError::Invariant(format!(
                    "protocol {name} is enabled but its path {:?} does not start with '/'",
                    descriptor.path
                )));
            }
        }
        Ok(())
    }

    /// Verify a previously built manifest (e.g. one read back from
    /// another process): signature present when the drift shield demands
    /// it, and matching the canonical content.
    pub fn verify_signature(&self, secret: Option<&str>) -> Result<(), ManifestError> {
        let Some(sig) = self.signature.as_deref() else {
            if self.enforcement.drift_shield_required {
                return Err(ManifestError::Invariant(
                    "drift_shield_required but manifest carries no signature".into(),
                ));
            }
            return Ok(());
        };
        let expected = self.compute_signature(secret)?;
        if sig != expected {
            return Err(ManifestError::Invariant(format!(
                "manifest signature mismatch: expected {expected}, found {sig}"
            )));
        }
        Ok(())
    }

    /// Whether error messages must be masked for this deployment.
    pub fn mask_errors(&self) -> bool {
        self.env.is_production() || self.enforcement.error_masking_enabled
    }

    /// HTTP status for a code, honoring the manifest override table.
    pub fn status_for(&self, code: ErrorCode) -> u16 {
        self.error_codes
            .get(code.as_str())
            .map(|p| p.status)
            .unwrap_or_else(|| code.default_status())
    }

    /// Recoverability override for a code, if the table has one.
    pub fn recoverable_for(&self, code: ErrorCode) -> Option<bool> {
        self.error_codes.get(code.as_str()).map(|p| p.recoverable)
    }

    /// The CORS policy for the manifest's environment.
    pub fn cors_policy(&self) -> &CorsPolicy {
        match self.env {
            Environment::Development => &self.cors.development,
            Environment::Staging => &self.cors.staging,
            Environment::Production => &self.cors.production,
        }
    }

    /// Deadline for a bucket, in milliseconds.
    pub fn timeout_ms(&self, bucket: TimeoutBucket) -> u64 {
        match bucket {
            TimeoutBucket::Default => self.timeouts.default_ms,
            TimeoutBucket::LongRunning => self.timeouts.long_running_ms,
            TimeoutBucket::Websocket => self.timeouts.websocket_ms,
            TimeoutBucket::HealthCheck => self.timeouts.health_check_ms,
        }
    }

    /// The mount path of an enabled protocol, if any.
    pub fn mount_path(&self, protocol: &str) -> Option<&str> {
        self.protocols
            .get(protocol)
            .filter(|d| d.enabled)
            .map(|d| d.path.as_str())
    }
}
