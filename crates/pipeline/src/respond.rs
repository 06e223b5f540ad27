//! Stage 13 — response header assembly.

use manifold_core::context::RequestContext;
use manifold_manifest::Manifest;

use crate::headers::origin_allowed;

/// Build the outbound header set: identity echoes, rate-limit headroom,
/// CORS for the requesting origin, the OWASP hardening set, and timing.
pub fn response_headers(
    manifest: &Manifest,
    ctx: &RequestContext,
    error_id: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(16);

    if !ctx.request_id.is_empty() {
        headers.push(("x-request-id".into(), ctx.request_id.clone()));
    }

    let api_version = ctx
        .auth
        .as_ref()
        .map(|a| a.api_version.clone())
        .unwrap_or_else(|| manifest.versioning.default.clone());
    headers.push(("x-api-version".into(), api_version));

    if let Some(auth) = &ctx.auth {
        headers.push(("x-tenant-id".into(), auth.tenant_id.clone()));
        headers.push(("x-user-id".into(), auth.user_id.clone()));
    }
    headers.push(("x-protocol".into(), ctx.protocol.as_str().to_string()));
    if !ctx.trace_id.is_empty() {
        headers.push(("x-trace-id".into(), ctx.trace_id.clone()));
    }
    if !ctx.span_id.is_empty() {
        headers.push(("x-span-id".into(), ctx.span_id.clone()));
    }

    if let Some(rate) = &ctx.rate_limit {
        headers.push(("x-ratelimit-remaining".into(), rate.remaining.to_string()));
        headers.push((
            "x-ratelimit-reset".into(),
            (rate.reset_at_ms / 1000).to_string(),
        ));
    }

    if let Some(error_id) = error_id {
        headers.push(("x-error-id".into(), error_id.to_string()));
    }

    // CORS echo for the actual response; preflight already answered
    // its own OPTIONS exchange.
    if let Some(origin) = ctx.header("origin") {
        let policy = manifest.cors_policy();
        if origin_allowed(&policy.allowed_origins, origin) {
            let allow = if policy.allowed_origins.iter().any(|o| o == "*") {
                "*".to_string()
            } else {
                origin.to_string()
            };
            headers.push(("access-control-allow-origin".into(), allow));
            if !policy.exposed_headers.is_empty() {
                headers.push((
                    "access-control-expose-headers".into(),
                    policy.exposed_headers.join(", "),
                ));
            }
        }
    }

    if manifest.hardening.security_headers_enabled {
        headers.push(("x-content-type-options".into(), "nosniff".into()));
        headers.push(("x-frame-options".into(), "DENY".into()));
        headers.push(("referrer-policy".into(), "no-referrer".into()));
        headers.push(("cache-control".into(), "no-store".into()));
        if manifest.hardening.strict_transport {
            headers.push((
                "strict-transport-security".into(),
                "max-age=31536000; includeSubDomains".into(),
            ));
        }
    }

    headers.push(("x-response-time".into(), format!("{}ms", ctx.elapsed_ms())));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::context::{AuthContext, Protocol, RateLimitState};
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::new(
            "GET",
            "/api/v1/engines",
            HashMap::new(),
            HashMap::new(),
            Protocol::Openapi,
        );
        ctx.request_id = "req-1".into();
        ctx.trace_id = "a".repeat(32);
        ctx.span_id = "b".repeat(16);
        let mut auth = AuthContext::anonymous("req-1", "v1");
        auth.tenant_id = "tenant-abc".into();
        auth.user_id = "alice".into();
        ctx.auth = Some(auth);
        ctx.rate_limit = Some(RateLimitState {
            remaining: 7,
            reset_at_ms: 1_700_000_123_456,
        });
        ctx
    }

    fn find<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn identity_and_rate_limit_echoes() {
        let manifest = Manifest::build(None, None).unwrap();
        let headers = response_headers(&manifest, &ctx(), None);

        assert_eq!(find(&headers, "x-request-id"), Some("req-1"));
        assert_eq!(find(&headers, "x-api-version"), Some("v1"));
        assert_eq!(find(&headers, "x-tenant-id"), Some("tenant-abc"));
        assert_eq!(find(&headers, "x-user-id"), Some("alice"));
        assert_eq!(find(&headers, "x-protocol"), Some("openapi"));
        assert_eq!(find(&headers, "x-ratelimit-remaining"), Some("7"));
        assert_eq!(find(&headers, "x-ratelimit-reset"), Some("1700000123"));
        assert!(find(&headers, "x-response-time").unwrap().ends_with("ms"));
        assert!(find(&headers, "x-error-id").is_none());
    }

    #[test]
    fn error_id_header_present_on_errors() {
        let manifest = Manifest::build(None, None).unwrap();
        let headers = response_headers(&manifest, &ctx(), Some("err-123"));
        assert_eq!(find(&headers, "x-error-id"), Some("err-123"));
    }

    #[test]
    fn owasp_set_toggles_with_hardening() {
        let on = Manifest::build(None, None).unwrap();
        let headers = response_headers(&on, &ctx(), None);
        assert_eq!(find(&headers, "x-content-type-options"), Some("nosniff"));
        assert_eq!(find(&headers, "x-frame-options"), Some("DENY"));
        assert!(find(&headers, "strict-transport-security").is_none());

        let hsts = Manifest::build(
            Some(&json!({"hardening": {"strict_transport": true}})),
            None,
        )
        .unwrap();
        let headers = response_headers(&hsts, &ctx(), None);
        assert!(find(&headers, "strict-transport-security").is_some());

        let off = Manifest::build(
            Some(&json!({"hardening": {"security_headers_enabled": false}})),
            None,
        )
        .unwrap();
        let headers = response_headers(&off, &ctx(), None);
        assert!(find(&headers, "x-content-type-options").is_none());
    }

    #[test]
    fn cors_echo_for_allowed_origin_only() {
        let manifest = Manifest::build(Some(&json!({"env": "staging"})), None).unwrap();

        let mut allowed = ctx();
        allowed
            .headers
            .insert("origin".into(), "http://localhost:3000".into());
        let headers = response_headers(&manifest, &allowed, None);
        assert_eq!(
            find(&headers, "access-control-allow-origin"),
            Some("http://localhost:3000")
        );

        let mut denied = ctx();
        denied.headers.insert("origin".into(), "https://evil".into());
        let headers = response_headers(&manifest, &denied, None);
        assert!(find(&headers, "access-control-allow-origin").is_none());
    }
}
