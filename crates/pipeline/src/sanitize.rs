//! Stages 9 and 11 — input sanitization and output validation.
//!
//! Both share one recursive traversal bounded by the manifest payload
//! ceilings. Sanitization rewrites the body (truncation, null-byte and
//! HTML stripping) and reports what it did; output validation only
//! checks, strictly in production and warn-only in development.

use manifold_core::context::RequestContext;
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_manifest::{Environment, Manifest, PayloadLimits};
use serde_json::Value;
use std::sync::LazyLock;

static HTML_TAG_RE: LazyLock<regex_lite::Regex> =
    LazyLock::new(|| regex_lite::Regex::new(r"<[^>]*>").expect("html tag pattern"));

static SUSPICIOUS_RE: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"(?i)<script|javascript:|__proto__|\beval\s*\(").expect("suspicious pattern")
});

/// Sanitize a value under the manifest limits. Returns the cleaned value
/// plus the names of every rule that fired.
pub fn sanitize(manifest: &Manifest, value: &Value) -> Result<(Value, Vec<String>), GatewayError> {
    let mut flags = Vec::new();
    let sanitized = walk(
        value,
        0,
        &manifest.payload_limits,
        manifest.security.strip_html,
        &mut flags,
    )?;
    flags.sort();
    flags.dedup();
    Ok((sanitized, flags))
}

fn walk(
    value: &Value,
    depth: usize,
    limits: &PayloadLimits,
    strip_html: bool,
    flags: &mut Vec<String>,
) -> Result<Value, GatewayError> {
    match value {
        Value::Object(map) => {
            if depth + 1 > limits.max_depth {
                return Err(depth_error(limits.max_depth));
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                out.insert(key.clone(), walk(child, depth + 1, limits, strip_html, flags)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            if depth + 1 > limits.max_depth {
                return Err(depth_error(limits.max_depth));
            }
            let keep = items.len().min(limits.max_array_length);
            if keep < items.len() {
                flags.push("array_truncated".into());
            }
            let mut out = Vec::with_capacity(keep);
            for item in &items[..keep] {
                out.push(walk(item, depth + 1, limits, strip_html, flags)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => Ok(Value::String(clean_string(s, limits, strip_html, flags))),
        other => Ok(other.clone()),
    }
}

fn clean_string(
    s: &str,
    limits: &PayloadLimits,
    strip_html: bool,
    flags: &mut Vec<String>,
) -> String {
    let mut out = s.to_string();
    if out.contains('\0') {
        out = out.replace('\0', "");
        flags.push("null_bytes_stripped".into());
    }
    if strip_html && HTML_TAG_RE.is_match(&out) {
        out = HTML_TAG_RE.replace_all(&out, "").into_owned();
        flags.push("html_stripped".into());
    }
    if SUSPICIOUS_RE.is_match(&out) {
        flags.push("suspicious_pattern".into());
    }
    if out.chars().count() > limits.max_string_length {
        out = out.chars().take(limits.max_string_length).collect();
        flags.push("string_truncated".into());
    }
    out
}

fn depth_error(max: usize) -> GatewayError {
    GatewayError::validation(format!("payload nesting exceeds the maximum depth of {max}"))
}

/// Stage 9 — sanitize the extracted body into `ctx.sanitized_input`.
pub fn sanitize_input(manifest: &Manifest, ctx: &mut RequestContext) -> Result<(), GatewayError> {
    let Some(body) = &ctx.body else {
        return Ok(());
    };
    if !manifest.security.sanitize_inputs {
        ctx.sanitized_input = Some(body.clone());
        return Ok(());
    }
    let (sanitized, flags) = sanitize(manifest, body)?;
    if !flags.is_empty() {
        tracing::debug!(request_id = %ctx.request_id, ?flags, "Sanitizer rules fired");
    }
    ctx.sanitized_input = Some(sanitized);
    ctx.sanitize_flags = flags;
    Ok(())
}

/// Stage 11 — validate response data against the same ceilings.
///
/// Returns the violation list; in any environment but development a
/// non-empty list is an `OUTPUT_VALIDATION_FAILED` error.
pub fn validate_output(manifest: &Manifest, data: &Value) -> Result<Vec<String>, GatewayError> {
    let limits = &manifest.payload_limits;
    let mut violations = Vec::new();
    check(data, 0, limits, &mut violations);

    let serialized_len = data.to_string().len();
    if serialized_len > limits.max_response_bytes {
        violations.push(format!(
            "response of {serialized_len} bytes exceeds the {}-byte limit",
            limits.max_response_bytes
        ));
    }

    if violations.is_empty() {
        return Ok(violations);
    }
    if manifest.env == Environment::Development {
        tracing::warn!(?violations, "Output validation violations (warn-only in development)");
        return Ok(violations);
    }
    Err(GatewayError::new(
        ErrorCode::OutputValidationFailed,
        violations.join("; "),
    ))
}

fn check(value: &Value, depth: usize, limits: &PayloadLimits, violations: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if depth + 1 > limits.max_depth {
                violations.push(format!("nesting exceeds depth {}", limits.max_depth));
                return;
            }
            for child in map.values() {
                check(child, depth + 1, limits, violations);
            }
        }
        Value::Array(items) => {
            if depth + 1 > limits.max_depth {
                violations.push(format!("nesting exceeds depth {}", limits.max_depth));
                return;
            }
            if items.len() > limits.max_array_length {
                violations.push(format!(
                    "array of {} items exceeds the limit of {}",
                    items.len(),
                    limits.max_array_length
                ));
            }
            for item in items {
                check(item, depth + 1, limits, violations);
            }
        }
        Value::String(s) => {
            if s.chars().count() > limits.max_string_length {
                violations.push(format!(
                    "string of {} chars exceeds the limit of {}",
                    s.chars().count(),
                    limits.max_string_length
                ));
            }
        }
        _ => {}
    }
}
