//! Stage 7 — zone guard: tenant-scoped and shared-resource boundaries.

use manifold_core::context::{RequestContext, ZoneDecision, normalize_tenant};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_manifest::Manifest;
use std::sync::LazyLock;

use crate::auth::is_anonymous_path;

static TENANT_ID_RE: LazyLock<regex_lite::Regex> =
    LazyLock::new(|| regex_lite::Regex::new(r"^[A-Za-z0-9_-]{3,64}$").expect("tenant pattern"));

static TARGET_TENANT_RE: LazyLock<regex_lite::Regex> =
    LazyLock::new(|| regex_lite::Regex::new(r"/tenants/([^/]+)").expect("target pattern"));

/// Collapse `//`, drop `.` and `..` segments, and trim the trailing `/`.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." | ".." => continue,
            s => segments.push(s),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    out
}

/// Whether `path` contains `prefix` on segment boundaries, so that
/// `/public/` matches `/api/v1/public/docs` but not `/api/v1/publications`.
fn segment_match(path: &str, prefix: &str) -> bool {
    let bare = prefix.trim_end_matches('/');
    path.contains(&format!("{bare}/")) || path.ends_with(bare)
}

/// Extract the target tenant from a `/tenants/{id}/...` path.
pub fn target_tenant(path: &str) -> Option<String> {
    TARGET_TENANT_RE
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| normalize_tenant(m.as_str()))
}

/// Enforce tenancy boundaries for this request.
pub fn zone_guard(manifest: &Manifest, ctx: &mut RequestContext) -> Result<(), GatewayError> {
    if !manifest.enforcement.zone_rules_enabled {
        ctx.zone = Some(ZoneDecision {
            allowed: true,
            ..Default::default()
        });
        return Ok(());
    }

    let auth = ctx
        .auth
        .clone()
        .ok_or_else(|| GatewayError::internal("zone guard ran before authentication"))?;
    let path = normalize_path(&ctx.path);

    // Malformed tenant ids never get further.
    if !auth.is_anonymous() && !TENANT_ID_RE.is_match(&auth.tenant_id) {
        return Err(GatewayError::validation(format!(
            "tenant id {:?} is malformed",
            auth.tenant_id
        )));
    }

    // A tenant header disagreeing with the authenticated tenant is a
    // spoof attempt, not a mistake worth tolerating.
    if let Some(header_tenant) = ctx.header("x-tenant-id") {
        let header_tenant = normalize_tenant(header_tenant);
        if !auth.is_anonymous() && header_tenant != auth.tenant_id {
            tracing::warn!(
                request_id = %ctx.request_id,
                header = %header_tenant,
                context = %auth.tenant_id,
                "Tenant header mismatch"
            );
            return Err(GatewayError::forbidden("tenant header does not match the authenticated tenant"));
        }
    }

    // Shared resources are reachable by anyone.
    if manifest
        .security
        .shared_resources
        .iter()
        .any(|prefix| segment_match(&path, prefix))
    {
        ctx.zone = Some(ZoneDecision {
            allowed: true,
            shared_resource: true,
            target_tenant: target_tenant(&path),
            ..Default::default()
        });
        return Ok(());
    }

    if auth.is_anonymous() {
        // The anonymous allowlist was already consulted by the auth
        // stage; anything else is off limits without credentials.
        if is_anonymous_path(manifest, &ctx.path) {
            ctx.zone = Some(ZoneDecision {
                allowed: true,
                ..Default::default()
            });
            return Ok(());
        }
        return Err(GatewayError::forbidden(
            "anonymous access is limited to shared resources",
        ));
    }

    if auth.is_system() && manifest.security.system_bypass_enabled {
        ctx.zone = Some(ZoneDecision {
            allowed: true,
            system_bypass: true,
            target_tenant: target_tenant(&path),
            ..Default::default()
        });
        return Ok(());
    }

    let target = target_tenant(&path);
    if let Some(target) = &target
        && *target != auth.tenant_id
    {
        let cross_allowed = manifest.security.cross_tenant_enabled
            && auth.has_permission(&manifest.security.cross_tenant_permission);
        if !cross_allowed {
            tracing::warn!(
                request_id = %ctx.request_id,
                tenant = %auth.tenant_id,
                target = %target,
                "Cross-tenant access denied"
            );
            return Err(GatewayError::new(
                ErrorCode::TenantIsolationEnforced,
                format!("tenant {} may not access resources of {target}", auth.tenant_id),
            ));
        }
        ctx.zone = Some(ZoneDecision {
            allowed: true,
            cross_tenant: true,
            target_tenant: Some(target.clone()),
            ..Default::default()
        });
        return Ok(());
    }

    // Isolated resources must name the caller's own tenant when they
    // name one at all.
    let isolated = manifest
        .security
        .isolated_resources
        .iter()
        .any(|prefix| segment_match(&path, prefix));
    if isolated && target.as_deref().is_some_and(|t| t != auth.tenant_id) {
        return Err(GatewayError::new(
            ErrorCode::TenantIsolationEnforced,
            "isolated resource belongs to another tenant",
        ));
    }

    ctx.zone = Some(ZoneDecision {
        allowed: true,
        target_tenant: target,
        ..Default::default()
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::context::{AuthContext, Protocol};
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};

    fn ctx_with_auth(path: &str, tenant: &str) -> RequestContext {
        let mut ctx = RequestContext::new("GET", path, HashMap::new(), HashMap::new(), Protocol::Openapi);
        ctx.request_id = "req-1".into();
        let mut auth = AuthContext::anonymous("req-1", "v1");
        auth.tenant_id = tenant.into();
        auth.user_id = "alice".into();
        auth.roles = BTreeSet::from(["user".to_string()]);
        ctx.auth = Some(auth);
        ctx
    }

    fn anonymous_ctx(path: &str) -> RequestContext {
        let mut ctx = RequestContext::new("GET", path, HashMap::new(), HashMap::new(), Protocol::Openapi);
        ctx.request_id = "req-1".into();
        ctx.auth = Some(AuthContext::anonymous("req-1", "v1"));
        ctx
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("/a//b/"), "/a/b");
        assert_eq!(normalize_path("/a/../../b"), "/a/b");
        assert_eq!(normalize_path("/a/./b"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//"), "/");
    }

    #[test]
    fn target_tenant_extraction() {
        assert_eq!(
            target_tenant("/api/v1/tenants/Tenant-XYZ/engines"),
            Some("tenant-xyz".into())
        );
        assert_eq!(target_tenant("/api/v1/engines"), None);
    }

    #[test]
    fn own_tenant_path_is_allowed() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut ctx = ctx_with_auth("/api/v1/tenants/tenant-abc/engines", "tenant-abc");
        zone_guard(&manifest, &mut ctx).unwrap();
        let zone = ctx.zone.unwrap();
        assert!(zone.allowed);
        assert_eq!(zone.target_tenant.as_deref(), Some("tenant-abc"));
        assert!(!zone.cross_tenant);
    }

    #[test]
    fn cross_tenant_denied_without_permission() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut ctx = ctx_with_auth("/api/v1/tenants/tenant-xyz/engines", "tenant-abc");
        let err = zone_guard(&manifest, &mut ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::TenantIsolationEnforced);
    }

    #[test]
    fn cross_tenant_allowed_with_flag_and_permission() {
        let manifest = Manifest::build(
            Some(&json!({"security": {"cross_tenant_enabled": true}})),
            None,
        )
        .unwrap();
        let mut ctx = ctx_with_auth("/api/v1/tenants/tenant-xyz/engines", "tenant-abc");
        ctx.auth
            .as_mut()
            .unwrap()
            .permissions
            .insert("tenants:cross".into());
        zone_guard(&manifest, &mut ctx).unwrap();
        assert!(ctx.zone.unwrap().cross_tenant);

        // the flag alone is not enough
        let mut no_perm = ctx_with_auth("/api/v1/tenants/tenant-xyz/engines", "tenant-abc");
        assert!(zone_guard(&manifest, &mut no_perm).is_err());
    }

    #[test]
    fn malformed_tenant_id_rejected() {
        let manifest = Manifest::build(None, None).unwrap();
        for bad in ["ab", "has space", "bad!chars", &"x".repeat(65)] {
            let mut ctx = ctx_with_auth("/api/v1/engines", bad);
            let err = zone_guard(&manifest, &mut ctx).unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationError, "tenant {bad:?}");
        }
    }

    #[test]
    fn spoofed_tenant_header_rejected() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut ctx = ctx_with_auth("/api/v1/engines", "tenant-abc");
        ctx.headers
            .insert("x-tenant-id".into(), "tenant-xyz".into());
        let err = zone_guard(&manifest, &mut ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[test]
    fn shared_resources_open_to_anonymous() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut ctx = anonymous_ctx("/api/v1/shared/catalog");
        zone_guard(&manifest, &mut ctx).unwrap();
        assert!(ctx.zone.unwrap().shared_resource);
    }

    #[test]
    fn shared_prefixes_match_whole_segments_only() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut lookalike = anonymous_ctx("/api/v1/publications");
        assert!(zone_guard(&manifest, &mut lookalike).is_err());

        let mut exact = anonymous_ctx("/api/v1/public");
        zone_guard(&manifest, &mut exact).unwrap();
        assert!(exact.zone.unwrap().shared_resource);
    }

    #[test]
    fn anonymous_denied_outside_shared_and_allowlist() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut ctx = anonymous_ctx("/api/v1/engines");
        let err = zone_guard(&manifest, &mut ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);

        // allowlisted health path passes
        let mut health = anonymous_ctx("/api/v1/health");
        zone_guard(&manifest, &mut health).unwrap();
        assert!(health.zone.unwrap().allowed);
    }

    #[test]
    fn system_bypass_requires_strict_context() {
        let manifest = Manifest::build(None, None).unwrap();

        let mut ctx = ctx_with_auth("/api/v1/tenants/tenant-xyz/engines", "internal-ops");
        {
            let auth = ctx.auth.as_mut().unwrap();
            auth.user_id = "system".into();
            auth.roles = BTreeSet::from(["system".to_string()]);
        }
        zone_guard(&manifest, &mut ctx).unwrap();
        assert!(ctx.zone.unwrap().system_bypass);

        // user id alone is a spoof, not a system context
        let mut spoof = ctx_with_auth("/api/v1/tenants/tenant-xyz/engines", "internal-ops");
        spoof.auth.as_mut().unwrap().user_id = "system".into();
        assert!(zone_guard(&manifest, &mut spoof).is_err());
    }

    #[test]
    fn bypass_disabled_in_manifest_blocks_system() {
        let manifest = Manifest::build(
            Some(&json!({"security": {"system_bypass_enabled": false}})),
            None,
        )
        .unwrap();
        let mut ctx = ctx_with_auth("/api/v1/tenants/tenant-xyz/engines", "internal-ops");
        {
            let auth = ctx.auth.as_mut().unwrap();
            auth.user_id = "system".into();
            auth.roles = BTreeSet::from(["system".to_string()]);
        }
        assert!(zone_guard(&manifest, &mut ctx).is_err());
    }

    #[test]
    fn traversal_cannot_escape_tenant_scoping() {
        let manifest = Manifest::build(None, None).unwrap();
        let mut ctx = ctx_with_auth("/api/v1/tenants/tenant-abc/../tenant-xyz/engines", "tenant-abc");
        // normalization strips the `..` segment; target stays tenant-abc
        zone_guard(&manifest, &mut ctx).unwrap();
        assert_eq!(
            ctx.zone.unwrap().target_tenant.as_deref(),
            Some("tenant-abc")
        );
    }

    #[test]
    fn zone_rules_disabled_allows_everything() {
        let manifest = Manifest::build(
            Some(&json!({"enforcement": {"zone_rules_enabled": false}})),
            None,
        )
        .unwrap();
        let mut ctx = anonymous_ctx("/api/v1/tenants/tenant-xyz/engines");
        zone_guard(&manifest, &mut ctx).unwrap();
        assert!(ctx.zone.unwrap().allowed);
    }
}
