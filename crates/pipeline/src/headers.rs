//! Header stages: CORS preflight, normalization, validation, and body
//! extraction.

use manifold_core::context::{self, RequestContext};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::envelope::WireResponse;
use manifold_manifest::Manifest;
use std::collections::HashMap;
use uuid::Uuid;

/// Forwarded-IP headers stripped when the manifest asks for it.
const FORWARDED_HEADERS: &[&str] = &["x-forwarded-for", "x-forwarded-host", "x-real-ip", "forwarded"];

/// Stage 1 — CORS preflight.
///
/// Returns a 204 short-circuit response for a matching `OPTIONS` request,
/// `None` for non-preflight traffic, and `CORS_ERROR` when the origin is
/// not allowed.
pub fn cors_preflight(
    manifest: &Manifest,
    ctx: &RequestContext,
) -> Result<Option<WireResponse>, GatewayError> {
    if ctx.method != "OPTIONS" {
        return Ok(None);
    }
    let Some(origin) = ctx.header("origin") else {
        // plain OPTIONS, not a CORS preflight
        return Ok(None);
    };

    let policy = manifest.cors_policy();
    if !origin_allowed(&policy.allowed_origins, origin) {
        return Err(GatewayError::new(
            ErrorCode::CorsError,
            format!("origin {origin:?} is not allowed"),
        ));
    }

    let allow_origin = if policy.allowed_origins.iter().any(|o| o == "*") {
        "*".to_string()
    } else {
        origin.to_string()
    };

    let mut headers = vec![
        ("access-control-allow-origin".to_string(), allow_origin),
        (
            "access-control-allow-methods".to_string(),
            policy.allowed_methods.join(", "),
        ),
        (
            "access-control-allow-headers".to_string(),
            policy.allowed_headers.join(", "),
        ),
        (
            "access-control-max-age".to_string(),
            policy.max_age_seconds.to_string(),
        ),
    ];
    if policy.allow_credentials {
        headers.push(("access-control-allow-credentials".to_string(), "true".to_string()));
    }

    Ok(Some(WireResponse {
        status: 204,
        headers,
        body: None,
    }))
}

pub(crate) fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|o| o == "*" || o == origin)
}

/// Lowercase every header key. Later duplicates win, which matches what
/// proxies do when they fold repeated headers.
pub fn normalize_header_map(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

/// Stage 2 — header validation & normalization.
///
/// Lowercases the header map, assigns request/trace/span ids, strips
/// forwarded-IP headers, and enforces the required-all, immutable-header,
/// and host-whitelist rules.
pub fn normalize_and_validate(
    manifest: &Manifest,
    ctx: &mut RequestContext,
) -> Result<(), GatewayError> {
    let mut headers = normalize_header_map(&ctx.headers);

    if manifest.hardening.strip_forwarded_headers {
        for name in FORWARDED_HEADERS {
            headers.remove(*name);
        }
    }

    // Immutable headers must never arrive from a client.
    for name in &manifest.security.immutable_headers {
        if headers.contains_key(&name.to_ascii_lowercase()) {
            return Err(GatewayError::forbidden(format!(
                "header {name} is reserved and must not be sent by clients"
            )));
        }
    }

    for name in &manifest.required_headers.all {
        if !headers.contains_key(&name.to_ascii_lowercase()) {
            return Err(GatewayError::validation(format!(
                "required header {name} is missing"
            )));
        }
    }

    if !manifest.hardening.host_whitelist.is_empty() {
        let host = headers
            .get("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        if !manifest.hardening.host_whitelist.iter().any(|h| *h == host) {
            return Err(GatewayError::forbidden(format!(
                "host {host:?} is not in the whitelist"
            )));
        }
    }

    let request_id = headers
        .get("x-request-id")
        .cloned()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    headers.insert("x-request-id".to_string(), request_id.clone());

    let trace_id = headers
        .get("x-trace-id")
        .filter(|v| context::is_hex_id(v, 32))
        .cloned()
        .unwrap_or_else(context::generate_trace_id);
    let span_id = headers
        .get("x-span-id")
        .filter(|v| context::is_hex_id(v, 16))
        .cloned()
        .unwrap_or_else(context::generate_span_id);

    ctx.headers = headers;
    ctx.request_id = request_id;
    ctx.trace_id = trace_id;
    ctx.span_id = span_id;
    Ok(())
}

/// Stage 3 — body extraction.
///
/// Best-effort: JSON when the content type says so, text otherwise.
/// GET/HEAD/OPTIONS carry no body.
pub fn extract_body(
    manifest: &Manifest,
    ctx: &mut RequestContext,
    raw: &[u8],
) -> Result<(), GatewayError> {
    if matches!(ctx.method.as_str(), "GET" | "HEAD" | "OPTIONS") || raw.is_empty() {
        return Ok(());
    }
    if raw.len() > manifest.payload_limits.max_request_bytes {
        return Err(GatewayError::new(
            ErrorCode::PayloadTooLarge,
            format!(
                "request body of {} bytes exceeds the {}-byte limit",
                raw.len(),
                manifest.payload_limits.max_request_bytes
            ),
        ));
    }

    let content_type = ctx.header("content-type").unwrap_or("").to_ascii_lowercase();
    if content_type.contains("application/json") {
        let parsed: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::validation(format!("request body is not valid JSON: {e}")))?;
        ctx.body = Some(parsed);
    } else {
        let text = String::from_utf8_lossy(raw).to_string();
        ctx.body = Some(serde_json::Value::String(text));
    }
    Ok(())
}
