//! Request-scoped contexts carried through the middleware pipeline.
//!
//! A [`RequestContext`] is owned by the task handling one request and is
//! destroyed with it; nothing here is shared across requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// The protocol surfaces the gateway can front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Openapi,
    Trpc,
    Graphql,
    Websocket,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Openapi => "openapi",
            Protocol::Trpc => "trpc",
            Protocol::Graphql => "graphql",
            Protocol::Websocket => "websocket",
            Protocol::Grpc => "grpc",
        }
    }

    pub fn parse(s: &str) -> Option<Protocol> {
        match s {
            "openapi" => Some(Protocol::Openapi),
            "trpc" => Some(Protocol::Trpc),
            "graphql" => Some(Protocol::Graphql),
            "websocket" => Some(Protocol::Websocket),
            "grpc" => Some(Protocol::Grpc),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity attached to a request after the authentication stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub tenant_id: String,
    pub user_id: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Negotiated API version for this request.
    pub api_version: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

impl AuthContext {
    /// The sentinel context for requests on the anonymous allowlist.
    pub fn anonymous(request_id: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            tenant_id: "anonymous".into(),
            user_id: "anonymous".into(),
            roles: BTreeSet::from(["anonymous".to_string()]),
            permissions: BTreeSet::new(),
            token: None,
            api_version: api_version.into(),
            request_id: request_id.into(),
            client_type: None,
            client_version: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == "anonymous"
    }

    /// System contexts require *both* the system user id and the system
    /// role. A spoofed header can fake one but not the other, which is the
    /// whole point of the conjunction.
    pub fn is_system(&self) -> bool {
        self.user_id == "system" && self.roles.contains("system")
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Outcome of the zone-guard stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneDecision {
    pub allowed: bool,
    /// Tenant extracted from a `/tenants/{id}/...` path, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_tenant: Option<String>,
    pub shared_resource: bool,
    pub system_bypass: bool,
    pub cross_tenant: bool,
}

/// Rate-limit headroom recorded by the limiter stages for the response
/// header assembly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitState {
    pub remaining: i64,
    pub reset_at_ms: u64,
}

/// Everything the pipeline accumulates while processing one request.
#[derive(Debug)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header map. The header-normalization stage lowercases all keys;
    /// before that stage runs, use [`RequestContext::header`] for lookups.
    pub headers: HashMap<String, String>,
    pub protocol: Protocol,
    /// Parsed request body (JSON object/value or string), if any.
    pub body: Option<serde_json::Value>,
    pub auth: Option<AuthContext>,
    pub zone: Option<ZoneDecision>,
    pub rate_limit: Option<RateLimitState>,
    /// Body after the sanitization stage.
    pub sanitized_input: Option<serde_json::Value>,
    /// Names of sanitizer rules that fired.
    pub sanitize_flags: Vec<String>,
    pub request_id: String,
    /// W3C-style 32-hex trace id.
    pub trace_id: String,
    /// W3C-style 16-hex span id.
    pub span_id: String,
    pub started_at: Instant,
    pub started_ts: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            query,
            headers,
            protocol,
            body: None,
            auth: None,
            zone: None,
            rate_limit: None,
            sanitized_input: None,
            sanitize_flags: Vec::new(),
            request_id: String::new(),
            trace_id: String::new(),
            span_id: String::new(),
            started_at: Instant::now(),
            started_ts: Utc::now(),
        }
    }

    /// Case-insensitive header lookup. Safe to call before the
    /// normalization stage has lowercased the map.
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    /// The effective tenant for rate limiting and audit: trimmed,
    /// lowercased, `anonymous` when absent.
    pub fn tenant_key(&self) -> String {
        let raw = self
            .auth
            .as_ref()
            .map(|a| a.tenant_id.as_str())
            .or_else(|| self.header("x-tenant-id"))
            .unwrap_or("");
        normalize_tenant(raw)
    }

    /// Milliseconds elapsed since the request entered the pipeline.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Normalize a tenant id: trim + lowercase; empty collapses to the
/// literal `anonymous`.
pub fn normalize_tenant(raw: &str) -> String {
    let t = raw.trim().to_ascii_lowercase();
    if t.is_empty() { "anonymous".into() } else { t }
}

/// Generate a random lowercase-hex string of `len` characters.
fn random_hex(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// A fresh 32-hex trace id.
pub fn generate_trace_id() -> String {
    random_hex(32)
}

/// A fresh 16-hex span id.
pub fn generate_span_id() -> String {
    random_hex(16)
}

/// Whether `s` is a well-formed lowercase hex id of the given length.
pub fn is_hex_id(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_context_is_sentinel() {
        let ctx = AuthContext::anonymous("req-1", "v1");
        assert_eq!(ctx.tenant_id, "anonymous");
        assert_eq!(ctx.user_id, "anonymous");
        assert!(ctx.roles.contains("anonymous"));
        assert!(ctx.is_anonymous());
        assert!(!ctx.is_system());
    }

    #[test]
    fn system_requires_both_user_and_role() {
        let mut ctx = AuthContext::anonymous("req-1", "v1");
        ctx.user_id = "system".into();
        assert!(!ctx.is_system(), "user id alone must not grant system");

        ctx.roles.insert("system".into());
        assert!(ctx.is_system());

        ctx.user_id = "alice".into();
        assert!(!ctx.is_system(), "role alone must not grant system");
    }

    #[test]
    fn tenant_normalization() {
        assert_eq!(normalize_tenant("  Tenant-ABC "), "tenant-abc");
        assert_eq!(normalize_tenant(""), "anonymous");
        assert_eq!(normalize_tenant("   "), "anonymous");
    }

    #[test]
    fn generated_ids_are_well_formed() {
        assert!(is_hex_id(&generate_trace_id(), 32));
        assert!(is_hex_id(&generate_span_id(), 16));
        assert!(!is_hex_id("XYZ", 3));
        assert!(!is_hex_id("ABCDEF0123456789", 16), "uppercase rejected");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("X-Tenant-ID".to_string(), "acme".to_string());
        let ctx = RequestContext::new("get", "/api/v1/health", headers, HashMap::new(), Protocol::Openapi);
        assert_eq!(ctx.header("x-tenant-id"), Some("acme"));
        assert_eq!(ctx.header("X-TENANT-ID"), Some("acme"));
        assert_eq!(ctx.method, "GET");
    }

    #[test]
    fn tenant_key_prefers_auth_context() {
        let mut headers = HashMap::new();
        headers.insert("x-tenant-id".to_string(), "from-header".to_string());
        let mut ctx =
            RequestContext::new("GET", "/x", headers, HashMap::new(), Protocol::Openapi);
        assert_eq!(ctx.tenant_key(), "from-header");

        let mut auth = AuthContext::anonymous("r", "v1");
        auth.tenant_id = "From-Auth".into();
        ctx.auth = Some(auth);
        assert_eq!(ctx.tenant_key(), "from-auth");
    }
}
