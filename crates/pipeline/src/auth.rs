//! Stage 6 — authentication and API-version negotiation.

use manifold_core::context::{AuthContext, RequestContext, normalize_tenant};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::token::TokenValidator;
use manifold_manifest::{Manifest, VersionStrategy};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Match a path against an anonymous-allowlist pattern: exact, `*`, or a
/// trailing-`*` prefix.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    pattern == path
}

/// Whether the path may be served without credentials.
pub fn is_anonymous_path(manifest: &Manifest, path: &str) -> bool {
    manifest
        .security
        .anonymous_paths
        .iter()
        .any(|p| path_matches(p, path))
}

static PATH_VERSION_RE: LazyLock<regex_lite::Regex> =
    LazyLock::new(|| regex_lite::Regex::new(r"/(v[0-9]+)(?:/|$)").expect("version pattern"));

/// Resolve the requested API version according to the manifest strategy.
pub fn negotiate_version(manifest: &Manifest, ctx: &RequestContext) -> Result<String, GatewayError> {
    let policy = &manifest.versioning;
    let requested = match policy.strategy {
        VersionStrategy::Header => ctx.header("x-api-version").map(str::to_string),
        VersionStrategy::Path => PATH_VERSION_RE
            .captures(&ctx.path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        VersionStrategy::Query => ctx.query.get("version").cloned(),
    };

    let mut version = match requested {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => policy.default.clone(),
    };

    if version == "latest" {
        if !policy.allow_latest_alias {
            return Err(GatewayError::validation(
                "the 'latest' version alias is disabled",
            ));
        }
        version = policy.latest.clone();
    }

    if !policy.supported.contains(&version) {
        return Err(GatewayError::validation(format!(
            "API version {version:?} is not supported"
        )));
    }
    Ok(version)
}

/// Authenticate the request, populating `ctx.auth`.
///
/// Anonymous-allowlist paths get the sentinel context; everything else
/// must present the authenticated header set and a token the injected
/// validator accepts.
pub async fn authenticate(
    manifest: &Manifest,
    validator: &dyn TokenValidator,
    ctx: &mut RequestContext,
) -> Result<(), GatewayError> {
    let version = negotiate_version(manifest, ctx)?;

    if is_anonymous_path(manifest, &ctx.path) {
        ctx.auth = Some(AuthContext::anonymous(ctx.request_id.clone(), version));
        return Ok(());
    }

    let token = ctx.header("authorization").map(str::to_string);

    if !manifest.security.require_auth && token.is_none() {
        ctx.auth = Some(AuthContext::anonymous(ctx.request_id.clone(), version));
        return Ok(());
    }

    for name in &manifest.required_headers.authenticated {
        let lower = name.to_ascii_lowercase();
        if ctx.header(&lower).is_none() {
            if lower == "x-tenant-id" && !manifest.security.require_tenant_id {
                continue;
            }
            if lower == "authorization" {
                return Err(GatewayError::unauthorized("missing Authorization header"));
            }
            return Err(GatewayError::validation(format!(
                "required header {name} is missing"
            )));
        }
    }

    let token = token.ok_or_else(|| GatewayError::unauthorized("missing Authorization header"))?;

    let validation = validator.validate(&token).await?;
    if !validation.valid {
        let reason = validation.error.unwrap_or_else(|| "invalid token".into());
        tracing::warn!(request_id = %ctx.request_id, %reason, "Authentication failed");
        return Err(GatewayError::new(ErrorCode::AuthError, reason));
    }

    let user_id = validation
        .user_id
        .ok_or_else(|| GatewayError::new(ErrorCode::AuthError, "token carries no subject"))?;

    let tenant_id = normalize_tenant(ctx.header("x-tenant-id").unwrap_or(""));
    if manifest.security.require_tenant_id && tenant_id == "anonymous" {
        return Err(GatewayError::validation("X-Tenant-ID header is required"));
    }

    ctx.auth = Some(AuthContext {
        tenant_id,
        user_id,
        roles: BTreeSet::from_iter(validation.roles),
        permissions: BTreeSet::from_iter(validation.permissions),
        token: Some(token),
        api_version: version,
        request_id: ctx.request_id.clone(),
        client_type: ctx.header("x-client-type").map(str::to_string),
        client_version: ctx.header("x-client-version").map(str::to_string),
    });
    Ok(())
}
