//! The token-validator contract and the reference implementation.
//!
//! Real deployments inject their own validator (JWT with signature
//! verification, API-key service, mTLS identity). The reference validator
//! here is structural only: it decodes JWT-shaped bearer tokens without
//! verifying signatures and resolves opaque API keys from a static table.

use crate::error::GatewayError;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a validator reports back for one token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenValidation {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// External collaborator that authenticates tokens.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenValidation, GatewayError>;
}

/// A static API-key record for the reference validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Reference validator: accepts `Bearer <jwt>` (payload decoded, exp
/// checked, **signature not verified**) and opaque `<prefix>_<key>` API
/// keys resolved against a configured table.
#[derive(Debug, Default)]
pub struct DefaultTokenValidator {
    api_keys: HashMap<String, ApiKeyRecord>,
}

impl DefaultTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_keys(api_keys: HashMap<String, ApiKeyRecord>) -> Self {
        Self { api_keys }
    }

    fn validate_bearer(&self, jwt: &str) -> TokenValidation {
        let parts: Vec<&str> = jwt.split('.').collect();
        if parts.len() != 3 {
            return TokenValidation::invalid("malformed bearer token");
        }
        let payload = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(parts[1]) {
            Ok(bytes) => bytes,
            Err(_) => return TokenValidation::invalid("token payload is not base64url"),
        };
        let claims: serde_json::Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(_) => return TokenValidation::invalid("token payload is not JSON"),
        };

        if let Some(exp) = claims.get("exp").and_then(serde_json::Value::as_i64)
            && exp < chrono::Utc::now().timestamp()
        {
            return TokenValidation::invalid("token expired");
        }

        let Some(sub) = claims.get("sub").and_then(serde_json::Value::as_str) else {
            return TokenValidation::invalid("token has no subject");
        };

        let roles = claims
            .get("roles")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| vec!["user".to_string()]);

        // `scope` is space-separated per RFC 8693; a `permissions` array
        // wins when both are present.
        let permissions = claims
            .get("permissions")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .or_else(|| {
                claims
                    .get("scope")
                    .and_then(serde_json::Value::as_str)
                    .map(|s| s.split_whitespace().map(String::from).collect())
            })
            .unwrap_or_default();

        TokenValidation {
            valid: true,
            user_id: Some(sub.to_string()),
            roles,
            permissions,
            error: None,
        }
    }

    fn validate_api_key(&self, token: &str) -> TokenValidation {
        match self.api_keys.get(token) {
            Some(record) => TokenValidation {
                valid: true,
                user_id: Some(record.user_id.clone()),
                roles: record.roles.clone(),
                permissions: record.permissions.clone(),
                error: None,
            },
            None => TokenValidation::invalid("unknown API key"),
        }
    }
}

#[async_trait]
impl TokenValidator for DefaultTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenValidation, GatewayError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(TokenValidation::invalid("empty token"));
        }
        if let Some(jwt) = token.strip_prefix("Bearer ") {
            return Ok(self.validate_bearer(jwt.trim()));
        }
        // Opaque key form: <prefix>_<key>
        if token.contains('_') && !token.contains(' ') {
            return Ok(self.validate_api_key(token));
        }
        Ok(TokenValidation::invalid("unrecognized token form"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_claims(claims: serde_json::Value) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"none"}"#);
        let payload = engine.encode(claims.to_string().as_bytes());
        format!("Bearer {header}.{payload}.sig")
    }

    #[tokio::test]
    async fn bearer_token_yields_subject_roles_and_scopes() {
        let validator = DefaultTokenValidator::new();
        let token = jwt_with_claims(serde_json::json!({
            "sub": "alice",
            "roles": ["admin"],
            "scope": "engines:read engines:write",
        }));
        let result = validator.validate(&token).await.unwrap();
        assert!(result.valid);
        assert_eq!(result.user_id.as_deref(), Some("alice"));
        assert_eq!(result.roles, vec!["admin"]);
        assert_eq!(result.permissions, vec!["engines:read", "engines:write"]);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let validator = DefaultTokenValidator::new();
        let token = jwt_with_claims(serde_json::json!({"sub": "alice", "exp": 1}));
        let result = validator.validate(&token).await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("token expired"));
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let validator = DefaultTokenValidator::new();
        let token = jwt_with_claims(serde_json::json!({"roles": ["user"]}));
        let result = validator.validate(&token).await.unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn api_key_resolves_from_table() {
        let mut keys = HashMap::new();
        keys.insert(
            "mk_live_abc123".to_string(),
            ApiKeyRecord {
                user_id: "svc-reporting".into(),
                roles: vec!["service".into()],
                permissions: vec!["reports:run".into()],
            },
        );
        let validator = DefaultTokenValidator::with_api_keys(keys);

        let hit = validator.validate("mk_live_abc123").await.unwrap();
        assert!(hit.valid);
        assert_eq!(hit.user_id.as_deref(), Some("svc-reporting"));

        let miss = validator.validate("mk_live_nope").await.unwrap();
        assert!(!miss.valid);
    }

    #[tokio::test]
    async fn garbage_tokens_are_invalid_not_errors() {
        let validator = DefaultTokenValidator::new();
        for junk in ["", "Bearer ", "Bearer a.b", "plain-token", "two words"] {
            let result = validator.validate(junk).await.unwrap();
            assert!(!result.valid, "{junk:?} should be invalid");
        }
    }

    #[tokio::test]
    async fn roles_default_to_user() {
        let validator = DefaultTokenValidator::new();
        let token = jwt_with_claims(serde_json::json!({"sub": "bob"}));
        let result = validator.validate(&token).await.unwrap();
        assert_eq!(result.roles, vec!["user"]);
    }
}
