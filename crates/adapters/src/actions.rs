//! Action-string policy shared by the REST and RPC execute surfaces.
//!
//! Two gates: a universal blocklist that nothing may pass, and a
//! production-only whitelist of manifest-configured patterns.

use manifold_core::error::GatewayError;
use manifold_manifest::Manifest;
use regex_lite::Regex;
use std::sync::LazyLock;

static BLOCKLIST: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("sql_mutation", r"(?i)\b(insert|update|delete|drop|alter|truncate)\s"),
        ("code_execution", r"(?i)\b(eval|exec|execfile|spawn)\s*\("),
        ("module_loading", r"(?i)\b(process|require|import)\s*[.(]"),
        ("prototype_access", r"__proto__|\bprototype\b|\bconstructor\b"),
    ]
    .iter()
    .map(|(name, pattern)| (*name, Regex::new(pattern).expect("action blocklist pattern")))
    .collect()
});

/// Validate an `execute` action string against both gates.
pub fn validate_action(manifest: &Manifest, action: &str) -> Result<(), GatewayError> {
    let action = action.trim();
    if action.is_empty() {
        return Err(GatewayError::validation("action must not be empty"));
    }

    for (name, pattern) in BLOCKLIST.iter() {
        if pattern.is_match(action) {
            tracing::warn!(action, rule = name, "Blocked action string");
            return Err(GatewayError::forbidden(format!(
                "action is blocked by the {name} rule"
            )));
        }
    }

    if manifest.env.is_production() {
        let allowed = manifest.security.action_whitelist.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(action))
                .unwrap_or(false)
        });
        if !allowed {
            return Err(GatewayError::forbidden(
                "action is not on the production whitelist",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_actions_pass_everywhere() {
        let dev = Manifest::build(None, None).unwrap();
        let prod = Manifest::build(Some(&json!({"env": "production"})), None).unwrap();
        for action in ["system.health()", "registry.listEngines()", "registry.getEngine(\"embedding\")"] {
            validate_action(&dev, action).unwrap();
            validate_action(&prod, action).unwrap();
        }
    }

    #[test]
    fn blocklist_applies_in_every_environment() {
        let dev = Manifest::build(None, None).unwrap();
        for action in [
            "DROP TABLE users",
            "delete from engines",
            "eval (payload)",
            "process.exit()",
            "require('fs')",
            "constructor.constructor('return this')",
            "obj.__proto__.polluted",
        ] {
            assert!(validate_action(&dev, action).is_err(), "{action:?} must be blocked");
        }
    }

    #[test]
    fn whitelist_is_production_only() {
        let dev = Manifest::build(None, None).unwrap();
        validate_action(&dev, "custom.workflow(run)").unwrap();

        let prod = Manifest::build(Some(&json!({"env": "production"})), None).unwrap();
        assert!(validate_action(&prod, "custom.workflow(run)").is_err());
    }

    #[test]
    fn empty_action_is_invalid() {
        let dev = Manifest::build(None, None).unwrap();
        assert!(validate_action(&dev, "   ").is_err());
    }
}
