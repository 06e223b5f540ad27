//! Stages 10 and 14 — audit classification and entry lifecycle.

use manifold_core::context::RequestContext;
use manifold_core::store::{AuditCategory, AuditEntry, AuditStatus, RiskLevel};
use manifold_manifest::Manifest;
use uuid::Uuid;

/// Classify the operation kind: system context wins, admin-surface paths
/// override the method mapping, everything else follows the verb.
pub fn classify_category(ctx: &RequestContext) -> AuditCategory {
    if ctx.auth.as_ref().is_some_and(|a| a.is_system()) {
        return AuditCategory::System;
    }
    if is_admin_path(&ctx.path) {
        return AuditCategory::Admin;
    }
    match ctx.method.as_str() {
        "DELETE" => AuditCategory::Delete,
        "POST" | "PUT" | "PATCH" => AuditCategory::Write,
        _ => AuditCategory::Read,
    }
}

fn is_admin_path(path: &str) -> bool {
    path.contains("/admin") || path.contains("/system") || path.contains("/internal")
}

/// Risk classification for the entry.
pub fn classify_risk(manifest: &Manifest, ctx: &RequestContext) -> RiskLevel {
    let high_risk_path = is_admin_path(&ctx.path)
        || manifest
            .security
            .high_risk_paths
            .iter()
            .any(|p| ctx.path.contains(p.as_str()));
    if high_risk_path {
        return RiskLevel::Critical;
    }
    if ctx.method == "DELETE" || ctx.auth.as_ref().is_some_and(|a| a.is_system()) {
        return RiskLevel::High;
    }
    if matches!(ctx.method.as_str(), "POST" | "PUT" | "PATCH") {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Whether this category gets an audit entry under the manifest toggles.
pub fn should_audit(manifest: &Manifest, category: AuditCategory) -> bool {
    if !manifest.security.audit_trail_required {
        return false;
    }
    match category {
        AuditCategory::Read => manifest.security.audit_reads,
        AuditCategory::Write | AuditCategory::Delete => manifest.security.audit_mutations,
        AuditCategory::Admin | AuditCategory::System => true,
    }
}

/// The action string for the entry: the body's `action` field when it
/// carries one, the method+path otherwise.
pub fn action_string(ctx: &RequestContext) -> String {
    ctx.body
        .as_ref()
        .and_then(|b| b.get("action"))
        .and_then(|a| a.as_str())
        .map(String::from)
        .unwrap_or_else(|| format!("{} {}", ctx.method, ctx.path))
}

/// Stage 10 — build the pending entry for a request that warrants one.
pub fn build_pending_entry(manifest: &Manifest, ctx: &RequestContext) -> Option<AuditEntry> {
    let category = classify_category(ctx);
    if !should_audit(manifest, category) {
        return None;
    }
    let auth = ctx.auth.as_ref();
    Some(AuditEntry {
        id: Uuid::new_v4().to_string(),
        timestamp: ctx.started_ts,
        hash: String::new(),
        previous_hash: String::new(),
        request_id: ctx.request_id.clone(),
        method: ctx.method.clone(),
        path: ctx.path.clone(),
        protocol: ctx.protocol.as_str().to_string(),
        tenant_id: auth.map(|a| a.tenant_id.clone()).unwrap_or_else(|| "anonymous".into()),
        user_id: auth.map(|a| a.user_id.clone()).unwrap_or_else(|| "anonymous".into()),
        roles: auth
            .map(|a| a.roles.iter().cloned().collect())
            .unwrap_or_default(),
        api_version: auth
            .map(|a| a.api_version.clone())
            .unwrap_or_else(|| manifest.versioning.default.clone()),
        client_type: auth.and_then(|a| a.client_type.clone()),
        trace_id: Some(ctx.trace_id.clone()).filter(|t| !t.is_empty()),
        span_id: Some(ctx.span_id.clone()).filter(|s| !s.is_empty()),
        action: action_string(ctx),
        category,
        risk_level: classify_risk(manifest, ctx),
        status: AuditStatus::Pending,
        status_code: None,
        error_code: None,
        duration_ms: None,
        metadata: None,
    })
}

/// Stage 14 — finish a pending entry for append.
pub fn finalize_entry(
    mut entry: AuditEntry,
    status_code: u16,
    error_code: Option<&str>,
    duration_ms: u64,
    exceptional: bool,
) -> AuditEntry {
    entry.status = if exceptional {
        AuditStatus::Error
    } else if status_code >= 400 {
        AuditStatus::Failure
    } else {
        AuditStatus::Success
    };
    entry.status_code = Some(status_code);
    entry.error_code = error_code.map(String::from);
    entry.duration_ms = Some(duration_ms);
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::context::{AuthContext, Protocol};
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};

    fn ctx(method: &str, path: &str) -> RequestContext {
        let mut ctx = RequestContext::new(method, path, HashMap::new(), HashMap::new(), Protocol::Openapi);
        ctx.request_id = "req-1".into();
        let mut auth = AuthContext::anonymous("req-1", "v1");
        auth.tenant_id = "tenant-abc".into();
        auth.user_id = "alice".into();
        ctx.auth = Some(auth);
        ctx
    }

    #[test]
    fn category_by_method_and_path() {
        assert_eq!(classify_category(&ctx("GET", "/api/v1/engines")), AuditCategory::Read);
        assert_eq!(classify_category(&ctx("POST", "/api/v1/execute")), AuditCategory::Write);
        assert_eq!(classify_category(&ctx("DELETE", "/api/v1/engines/x")), AuditCategory::Delete);
        assert_eq!(classify_category(&ctx("GET", "/api/v1/admin/users")), AuditCategory::Admin);

        let mut system = ctx("POST", "/api/v1/execute");
        {
            let auth = system.auth.as_mut().unwrap();
            auth.user_id = "system".into();
            auth.roles = BTreeSet::from(["system".to_string()]);
        }
        assert_eq!(classify_category(&system), AuditCategory::System);
    }

    #[test]
    fn risk_ladder() {
        let m = Manifest::build(None, None).unwrap();
        assert_eq!(classify_risk(&m, &ctx("GET", "/api/v1/engines")), RiskLevel::Low);
        assert_eq!(classify_risk(&m, &ctx("POST", "/api/v1/execute")), RiskLevel::Medium);
        assert_eq!(classify_risk(&m, &ctx("DELETE", "/api/v1/engines/x")), RiskLevel::High);
        assert_eq!(classify_risk(&m, &ctx("POST", "/api/v1/admin/seed")), RiskLevel::Critical);
    }

    #[test]
    fn audit_toggles_respected() {
        let m = Manifest::build(None, None).unwrap();
        assert!(!should_audit(&m, AuditCategory::Read), "reads off by default");
        assert!(should_audit(&m, AuditCategory::Write));
        assert!(should_audit(&m, AuditCategory::Admin));

        let reads_on = Manifest::build(Some(&json!({"security": {"audit_reads": true}})), None).unwrap();
        assert!(should_audit(&reads_on, AuditCategory::Read));

        let trail_off = Manifest::build(
            Some(&json!({"security": {
                "audit_trail_required": false,
                "audit_mutations": false,
            }})),
            None,
        )
        .unwrap();
        assert!(!should_audit(&trail_off, AuditCategory::Admin));
    }

    #[test]
    fn pending_entry_skips_unlogged_reads() {
        let m = Manifest::build(None, None).unwrap();
        assert!(build_pending_entry(&m, &ctx("GET", "/api/v1/health")).is_none());

        let entry = build_pending_entry(&m, &ctx("POST", "/api/v1/execute")).unwrap();
        assert_eq!(entry.status, AuditStatus::Pending);
        assert_eq!(entry.tenant_id, "tenant-abc");
        assert_eq!(entry.category, AuditCategory::Write);
        assert_eq!(entry.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn action_prefers_the_body_action() {
        let mut c = ctx("POST", "/api/v1/execute");
        c.body = Some(json!({"action": "registry.listEngines()"}));
        assert_eq!(action_string(&c), "registry.listEngines()");

        let plain = ctx("DELETE", "/api/v1/engines/x");
        assert_eq!(action_string(&plain), "DELETE /api/v1/engines/x");
    }

    #[test]
    fn finalize_sets_status_from_code() {
        let m = Manifest::build(None, None).unwrap();
        let pending = build_pending_entry(&m, &ctx("POST", "/api/v1/execute")).unwrap();

        let ok = finalize_entry(pending.clone(), 200, None, 12, false);
        assert_eq!(ok.status, AuditStatus::Success);
        assert_eq!(ok.duration_ms, Some(12));

        let failed = finalize_entry(pending.clone(), 403, Some("FORBIDDEN"), 3, false);
        assert_eq!(failed.status, AuditStatus::Failure);
        assert_eq!(failed.error_code.as_deref(), Some("FORBIDDEN"));

        let exceptional = finalize_entry(pending, 504, Some("GATEWAY_TIMEOUT"), 30_000, true);
        assert_eq!(exceptional.status, AuditStatus::Error);
    }
}
