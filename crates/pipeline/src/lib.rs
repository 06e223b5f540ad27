//! The middleware pipeline for the Manifold gateway.
//!
//! Two fixed-order phases wrap every kernel dispatch:
//!
//! ```text
//! pre:  (1) cors preflight → (2) headers → (3) body → (4) burst limit
//!       → (5) window limit → (6) auth → (7) zone guard → (8) firewall
//!       → (9) sanitize → (10) audit request
//! post: (11) output validation → (12) firewall post
//!       → (13) response headers → (14) audit response
//! ```
//!
//! The order is a security contract, not a configuration knob — stages
//! are composed in code and always run in this sequence. Each stage is a
//! function of the manifest and the request context; the first failure
//! terminates the pre phase, while the response-header and
//! audit-finalization stages run for error responses too.

pub mod audit;
pub mod auth;
pub mod firewall;
pub mod headers;
pub mod ratelimit;
pub mod respond;
pub mod sanitize;
pub mod zone;

use manifold_core::context::RequestContext;
use manifold_core::envelope::WireResponse;
use manifold_core::error::GatewayError;
use manifold_core::store::{AuditEntry, AuditStore, RateLimitStore};
use manifold_core::token::TokenValidator;
use manifold_manifest::Manifest;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use firewall::Firewall;

/// Result of the pre-handler phase.
#[derive(Debug)]
pub enum PreOutcome {
    /// All stages passed; dispatch to the adapter.
    Continue,
    /// A stage answered the request itself (CORS preflight).
    ShortCircuit(WireResponse),
}

/// The ordered pre/post middleware chain plus the request-scoped audit
/// bookkeeping. One pipeline serves the whole process; per-request state
/// lives in the [`RequestContext`].
pub struct Pipeline {
    manifest: Arc<Manifest>,
    rate_limits: Arc<dyn RateLimitStore>,
    audit_store: Arc<dyn AuditStore>,
    validator: Arc<dyn TokenValidator>,
    firewall: Firewall,
    pending_audits: Mutex<HashMap<String, AuditEntry>>,
}

impl Pipeline {
    pub fn new(
        manifest: Arc<Manifest>,
        rate_limits: Arc<dyn RateLimitStore>,
        audit_store: Arc<dyn AuditStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        let firewall = Firewall::from_manifest(&manifest);
        Self {
            manifest,
            rate_limits,
            audit_store,
            validator,
            firewall,
            pending_audits: Mutex::new(HashMap::new()),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit_store
    }

    /// Run the pre-handler phase, stopping on the first failure.
    pub async fn run_pre(
        &self,
        ctx: &mut RequestContext,
        raw_body: &[u8],
    ) -> Result<PreOutcome, GatewayError> {
        if let Some(response) = headers::cors_preflight(&self.manifest, ctx)? {
            return Ok(PreOutcome::ShortCircuit(response));
        }
        headers::normalize_and_validate(&self.manifest, ctx)?;
        headers::extract_body(&self.manifest, ctx, raw_body)?;
        ratelimit::burst_limit(&self.manifest, self.rate_limits.as_ref(), ctx).await?;
        ratelimit::window_limit(&self.manifest, self.rate_limits.as_ref(), ctx).await?;
        auth::authenticate(&self.manifest, self.validator.as_ref(), ctx).await?;
        zone::zone_guard(&self.manifest, ctx)?;
        self.firewall.pre_check(&self.manifest, ctx)?;
        sanitize::sanitize_input(&self.manifest, ctx)?;

        if let Some(entry) = audit::build_pending_entry(&self.manifest, ctx) {
            self.pending_audits
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(ctx.request_id.clone(), entry);
        }
        Ok(PreOutcome::Continue)
    }

    /// Stages 11–12: validate and scrub the adapter's result before it is
    /// wrapped for the wire.
    pub fn check_output(&self, data: &Value) -> Result<(), GatewayError> {
        sanitize::validate_output(&self.manifest, data)?;
        self.firewall.post_check(data)?;
        Ok(())
    }

    /// Stage 13: the outbound header set for this request.
    pub fn response_headers(
        &self,
        ctx: &RequestContext,
        error_id: Option<&str>,
    ) -> Vec<(String, String)> {
        respond::response_headers(&self.manifest, ctx, error_id)
    }

    /// Stage 14: finish and append the pending audit entry, if one was
    /// opened for this request. Append failures are logged, never
    /// surfaced — the response is already decided by now.
    pub async fn finalize_audit(
        &self,
        ctx: &RequestContext,
        status_code: u16,
        error_code: Option<&str>,
        exceptional: bool,
    ) {
        let pending = self
            .pending_audits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.request_id);
        let Some(entry) = pending else {
            return;
        };
        let entry =
            audit::finalize_entry(entry, status_code, error_code, ctx.elapsed_ms(), exceptional);
        if let Err(e) = self.audit_store.append(entry).await {
            tracing::error!(request_id = %ctx.request_id, error = %e, "Audit append failed");
        }
    }

    /// Number of requests with an open pending entry (tests/inspection).
    pub fn pending_audit_count(&self) -> usize {
        self.pending_audits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use manifold_core::context::Protocol;
    use manifold_core::error::ErrorCode;
    use manifold_core::store::AuditStatus;
    use manifold_core::token::TokenValidation;
    use manifold_stores::{MemoryAuditStore, MemoryRateLimitStore};
    use serde_json::json;

    struct AcceptAll;

    #[async_trait]
    impl TokenValidator for AcceptAll {
        async fn validate(&self, _token: &str) -> Result<TokenValidation, GatewayError> {
            Ok(TokenValidation {
                valid: true,
                user_id: Some("alice".into()),
                roles: vec!["user".into()],
                permissions: vec![],
                error: None,
            })
        }
    }

    fn pipeline_with(patch: Option<serde_json::Value>) -> (Pipeline, Arc<MemoryAuditStore>) {
        let manifest = Manifest::build(patch.as_ref(), None).unwrap();
        let audit = Arc::new(MemoryAuditStore::new());
        let pipeline = Pipeline::new(
            manifest,
            Arc::new(MemoryRateLimitStore::new()),
            audit.clone(),
            Arc::new(AcceptAll),
        );
        (pipeline, audit)
    }

    fn request(method: &str, path: &str, headers: &[(&str, &str)]) -> RequestContext {
        let map = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestContext::new(method, path, map, HashMap::new(), Protocol::Openapi)
    }

    #[tokio::test]
    async fn anonymous_health_passes_without_audit() {
        let (pipeline, audit) = pipeline_with(None);
        let mut ctx = request("GET", "/api/v1/health", &[("Host", "api")]);

        let outcome = pipeline.run_pre(&mut ctx, b"").await.unwrap();
        assert!(matches!(outcome, PreOutcome::Continue));
        assert!(ctx.auth.as_ref().unwrap().is_anonymous());
        assert_eq!(pipeline.pending_audit_count(), 0);

        pipeline.finalize_audit(&ctx, 200, None, false).await;
        assert_eq!(audit.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn authenticated_execute_opens_and_closes_an_audit_entry() {
        let (pipeline, audit) = pipeline_with(None);
        let mut ctx = request(
            "POST",
            "/api/v1/execute",
            &[
                ("Host", "api"),
                ("Authorization", "Bearer a.b.c"),
                ("X-Tenant-ID", "tenant-abc"),
                ("Content-Type", "application/json"),
            ],
        );

        pipeline
            .run_pre(&mut ctx, br#"{"action":"registry.listEngines()"}"#)
            .await
            .unwrap();
        assert_eq!(pipeline.pending_audit_count(), 1);

        pipeline.finalize_audit(&ctx, 200, None, false).await;
        assert_eq!(pipeline.pending_audit_count(), 0);

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.status, AuditStatus::Success);
        assert_eq!(entry.action, "registry.listEngines()");
        assert_eq!(entry.tenant_id, "tenant-abc");
        assert_eq!(entry.previous_hash, "genesis");
        assert!(manifold_core::store::verify_chain(&entries, None));
    }

    #[tokio::test]
    async fn failures_stop_the_chain_before_later_stages() {
        let (pipeline, _) = pipeline_with(Some(json!({
            "rate_limits": {"burst": {"max": 1, "window_ms": 1000}}
        })));

        let headers = [
            ("Host", "api"),
            ("Authorization", "Bearer a.b.c"),
            ("X-Tenant-ID", "tenant-abc"),
        ];
        let mut first = request("POST", "/api/v1/execute", &headers);
        pipeline.run_pre(&mut first, b"").await.unwrap();

        let mut second = request("POST", "/api/v1/execute", &headers);
        let err = pipeline.run_pre(&mut second, b"").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert!(second.auth.is_none(), "auth stage must not have run");
        assert_eq!(pipeline.pending_audit_count(), 1, "only the first request was audited");
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let (pipeline, _) = pipeline_with(None);
        let mut ctx = request(
            "OPTIONS",
            "/api/v1/execute",
            &[("Host", "api"), ("Origin", "http://localhost:3000")],
        );
        match pipeline.run_pre(&mut ctx, b"").await.unwrap() {
            PreOutcome::ShortCircuit(resp) => assert_eq!(resp.status, 204),
            PreOutcome::Continue => panic!("expected a preflight short-circuit"),
        }
    }

    #[tokio::test]
    async fn finalize_records_failures_with_error_codes() {
        let (pipeline, audit) = pipeline_with(None);
        let mut ctx = request(
            "POST",
            "/api/v1/execute",
            &[
                ("Host", "api"),
                ("Authorization", "Bearer a.b.c"),
                ("X-Tenant-ID", "tenant-abc"),
            ],
        );
        pipeline.run_pre(&mut ctx, b"").await.unwrap();
        pipeline
            .finalize_audit(&ctx, 504, Some("GATEWAY_TIMEOUT"), true)
            .await;

        let entries = audit.entries();
        assert_eq!(entries[0].status, AuditStatus::Error);
        assert_eq!(entries[0].error_code.as_deref(), Some("GATEWAY_TIMEOUT"));
        assert_eq!(entries[0].status_code, Some(504));
    }

    #[tokio::test]
    async fn check_output_rejects_leaky_data_in_production() {
        let (pipeline, _) = pipeline_with(Some(json!({"env": "production"})));
        assert!(pipeline.check_output(&json!({"ok": true})).is_ok());
        let err = pipeline
            .check_output(&json!({"debug": {"sql": "SELECT 1"}}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OutputValidationFailed);
    }
}
