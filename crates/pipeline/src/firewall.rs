//! Stages 8 and 12 — the AI firewall.
//!
//! Pre-check: a compiled risk-factor table scores the serialized request
//! body; AI-facing paths additionally run the prompt-injection detector
//! (the pattern list ships in the manifest so operators can tune it
//! without a rebuild). Post-check: responses must not leak internal
//! fields or unredacted PII-named keys.

use manifold_core::context::RequestContext;
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_manifest::Manifest;
use regex_lite::Regex;
use serde_json::Value;

/// Response keys that indicate an internal leak.
const LEAKAGE_KEYS: &[&str] = &["stack", "trace", "internalError", "debug", "sql", "env", "process"];

/// Values accepted for a PII-named key.
fn is_redacted(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty() || s == "[REDACTED]",
        _ => false,
    }
}

struct RiskFactor {
    name: &'static str,
    pattern: Regex,
    weight: f64,
    critical: bool,
}

/// Compiled firewall state. Build once at boot, share per-request.
pub struct Firewall {
    factors: Vec<RiskFactor>,
    prompt_patterns: Vec<Regex>,
    pii_key: Regex,
    threshold: f64,
    critical_multiplier: f64,
    bypass_paths: Vec<String>,
    ai_paths: Vec<String>,
}

impl Firewall {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let policy = &manifest.ai_firewall;

        let factors = vec![
            factor("xss", r"(?i)<script|javascript:|onerror\s*=|onload\s*=", 0.7, false),
            factor(
                "prototype_pollution",
                r"__proto__|\bconstructor\s*\[|\bprototype\s*\[",
                0.8,
                true,
            ),
            factor("template_injection", r"\{\{[^}]*\}\}|\$\{[^}]*\}", 0.4, false),
            factor(
                "code_execution",
                r"(?i)\beval\s*\(|\bFunction\s*\(|\brequire\s*\(|\bimport\s*\(",
                0.9,
                true,
            ),
            factor(
                "sql_injection",
                r"(?i)union\s+select|;\s*drop\s+table|'\s*(or|and)\s+'?[0-9a-z]+'?\s*=|--\s",
                0.7,
                false,
            ),
        ];

        let prompt_patterns = policy
            .prompt_injection_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Skipping invalid prompt-injection pattern");
                    None
                }
            })
            .collect();

        Self {
            factors,
            prompt_patterns,
            pii_key: Regex::new(
                r"(?i)^(ssn|social_security(_number)?|credit_card|card_number|cvv|password|passwd|secret|api_key|private_key|access_token|phone(_number)?|email(_address)?)$",
            )
            .expect("pii key pattern"),
            threshold: policy.risk_threshold,
            critical_multiplier: policy.critical_multiplier,
            bypass_paths: policy.bypass_paths.clone(),
            ai_paths: policy.ai_paths.clone(),
        }
    }

    /// Stage 8 — score the request body before dispatch.
    pub fn pre_check(&self, manifest: &Manifest, ctx: &RequestContext) -> Result<(), GatewayError> {
        if !manifest.enforcement.ai_firewall_required {
            return Ok(());
        }
        if ctx.auth.as_ref().is_some_and(|a| a.is_system()) {
            return Ok(());
        }
        if self.bypass_paths.iter().any(|p| p == &ctx.path) {
            return Ok(());
        }
        let Some(body) = &ctx.body else {
            return Ok(());
        };
        let serialized = body.to_string();

        let mut flags: Vec<&str> = Vec::new();
        let mut score = 0.0;
        for factor in &self.factors {
            if factor.pattern.is_match(&serialized) {
                flags.push(factor.name);
                score += if factor.critical {
                    factor.weight * self.critical_multiplier
                } else {
                    factor.weight
                };
            }
        }

        if self.ai_paths.iter().any(|p| ctx.path.contains(p.as_str()))
            && self.prompt_patterns.iter().any(|re| re.is_match(&serialized))
        {
            flags.push("prompt_injection");
            score += 0.8;
        }

        if score >= self.threshold {
            tracing::warn!(
                request_id = %ctx.request_id,
                score,
                flags = ?flags,
                "AI firewall blocked request"
            );
            return Err(GatewayError::new(
                ErrorCode::AiFirewallBlocked,
                "request blocked by the AI firewall",
            )
            .with_detail(serde_json::json!({"flags": flags, "score": score})));
        }
        Ok(())
    }

    /// Stage 12 — reject leaking responses.
    pub fn post_check(&self, data: &Value) -> Result<(), GatewayError> {
        self.scan_value(data)
    }

    fn scan_value(&self, value: &Value) -> Result<(), GatewayError> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if LEAKAGE_KEYS.contains(&key.as_str()) {
                        return Err(GatewayError::new(
                            ErrorCode::OutputValidationFailed,
                            format!("response leaks internal field {key:?}"),
                        ));
                    }
                    if self.pii_key.is_match(key) && !is_redacted(child) {
                        return Err(GatewayError::new(
                            ErrorCode::OutputValidationFailed,
                            format!("response carries unredacted field {key:?}"),
                        ));
                    }
                    self.scan_value(child)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.scan_value(item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn factor(name: &'static str, pattern: &str, weight: f64, critical: bool) -> RiskFactor {
    RiskFactor {
        name,
        pattern: Regex::new(pattern).expect("risk factor pattern"),
        weight,
        critical,
    }
}
