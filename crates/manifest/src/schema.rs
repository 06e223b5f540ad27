//! The manifest schema.
//!
//! Every policy knob the gateway consults lives here. The struct tree maps
//! directly to the manifest document; field defaults are the shipping
//! baseline that overrides are deep-merged onto.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Deployment environment. Drives CORS matrix selection, error masking,
/// action whitelisting, and strict output validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// One protocol surface: whether it is mounted and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub enabled: bool,
    /// Mount path, must begin with `/` when enabled.
    pub path: String,
}

/// Version negotiation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningPolicy {
    /// Where the requested version travels.
    pub strategy: VersionStrategy,
    pub default: String,
    pub latest: String,
    pub supported: BTreeSet<String>,
    pub allow_latest_alias: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStrategy {
    Header,
    Path,
    Query,
}

impl Default for VersioningPolicy {
    fn default() -> Self {
        Self {
            strategy: VersionStrategy::Header,
            default: "v1".into(),
            latest: "v1".into(),
            supported: BTreeSet::from(["v1".to_string()]),
            allow_latest_alias: true,
        }
    }
}

/// A fixed-window limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max: u32,
    pub window_ms: u64,
}

/// WebSocket-specific ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketLimits {
    pub messages_per_second: u32,
    pub max_connections_per_tenant: u32,
    pub max_payload_bytes: usize,
    pub max_nesting_depth: usize,
    pub heartbeat_interval_ms: u64,
}

impl Default for SocketLimits {
    fn default() -> Self {
        Self {
            messages_per_second: 20,
            max_connections_per_tenant: 50,
            max_payload_bytes: 100 * 1024,
            max_nesting_depth: 10,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// GraphQL structural ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphqlLimits {
    pub max_depth: usize,
    pub max_complexity: usize,
}

impl Default for GraphqlLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_complexity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    /// Long window (per minute by default).
    pub requests: WindowLimit,
    /// Short window (per second by default).
    pub burst: WindowLimit,
    pub websocket: SocketLimits,
    pub graphql: GraphqlLimits,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests: WindowLimit {
                max: 600,
                window_ms: 60_000,
            },
            burst: WindowLimit {
                max: 100,
                window_ms: 1_000,
            },
            websocket: SocketLimits::default(),
            graphql: GraphqlLimits::default(),
        }
    }
}

/// Payload ceilings applied by body extraction and the sanitizer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PayloadLimits {
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub max_array_length: usize,
    pub max_string_length: usize,
    pub max_depth: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: 1024 * 1024,
            max_response_bytes: 4 * 1024 * 1024,
            max_array_length: 1_000,
            max_string_length: 100_000,
            max_depth: 16,
        }
    }
}

/// Header requirements by request class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredHeaders {
    /// Required on every request.
    pub all: Vec<String>,
    /// Additionally required on authenticated requests.
    pub authenticated: Vec<String>,
    /// Recognized but never required.
    pub optional: Vec<String>,
}

impl Default for RequiredHeaders {
    fn default() -> Self {
        Self {
            all: vec!["host".into()],
            authenticated: vec!["authorization".into(), "x-tenant-id".into()],
            optional: vec![
                "x-api-version".into(),
                "x-client-type".into(),
                "x-client-version".into(),
                "x-trace-id".into(),
                "x-span-id".into(),
            ],
        }
    }
}

/// CORS policy for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsPolicy {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".into()],
            allowed_methods: vec![
                "GET".into(),
                "POST".into(),
                "PUT".into(),
                "PATCH".into(),
                "DELETE".into(),
                "OPTIONS".into(),
            ],
            allowed_headers: vec![
                "content-type".into(),
                "authorization".into(),
                "x-tenant-id".into(),
                "x-request-id".into(),
                "x-api-version".into(),
            ],
            exposed_headers: vec![
                "x-request-id".into(),
                "x-ratelimit-remaining".into(),
                "x-ratelimit-reset".into(),
                "x-error-id".into(),
            ],
            allow_credentials: false,
            max_age_seconds: 3_600,
        }
    }
}

/// CORS matrices keyed by environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsMatrix {
    pub development: CorsPolicy,
    pub staging: CorsPolicy,
    pub production: CorsPolicy,
}

impl Default for CorsMatrix {
    fn default() -> Self {
        Self {
            development: CorsPolicy {
                allowed_origins: vec!["*".into()],
                ..CorsPolicy::default()
            },
            staging: CorsPolicy::default(),
            production: CorsPolicy {
                allowed_origins: vec![],
                ..CorsPolicy::default()
            },
        }
    }
}

/// Security flags and tenancy boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub require_auth: bool,
    pub require_tenant_id: bool,
    pub tenant_isolation_required: bool,
    pub audit_trail_required: bool,
    /// Log writes (POST/PUT/PATCH/DELETE).
    pub audit_mutations: bool,
    /// Also log reads.
    pub audit_reads: bool,
    pub sanitize_inputs: bool,
    pub strip_html: bool,
    /// Paths served without authentication: exact, `*`, or trailing-`*`
    /// prefix patterns.
    pub anonymous_paths: Vec<String>,
    /// Headers a client must never send.
    pub immutable_headers: Vec<String>,
    /// Path prefixes reachable across tenants without cross-tenant rights.
    pub shared_resources: Vec<String>,
    /// Path prefixes that must stay inside the caller's tenant.
    pub isolated_resources: Vec<String>,
    pub system_bypass_enabled: bool,
    pub cross_tenant_enabled: bool,
    pub cross_tenant_permission: String,
    /// Paths classified critical for audit risk.
    pub high_risk_paths: Vec<String>,
    /// Production whitelist for `execute` action strings (regex patterns).
    pub action_whitelist: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            require_auth: true,
            require_tenant_id: true,
            tenant_isolation_required: true,
            audit_trail_required: true,
            audit_mutations: true,
            audit_reads: false,
            sanitize_inputs: true,
            strip_html: false,
            anonymous_paths: vec!["/api/v1/health".into(), "/api/v1/openapi.json".into()],
            immutable_headers: vec!["x-kernel-signature".into(), "x-internal-trace".into()],
            shared_resources: vec!["/shared/".into(), "/public/".into()],
            isolated_resources: vec!["/tenants/".into()],
            system_bypass_enabled: true,
            cross_tenant_enabled: false,
            cross_tenant_permission: "tenants:cross".into(),
            high_risk_paths: vec!["/admin".into(), "/system".into(), "/internal".into()],
            action_whitelist: vec![
                r"^system\.[a-zA-Z]+\(\)$".into(),
                r#"^registry\.[a-zA-Z]+\((?:"[a-zA-Z0-9_.-]+")?\)$"#.into(),
            ],
        }
    }
}

/// Which pipeline defenses are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementPolicy {
    pub drift_shield_required: bool,
    pub rate_limit_required: bool,
    pub ai_firewall_required: bool,
    pub error_masking_enabled: bool,
    pub zone_rules_enabled: bool,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            drift_shield_required: true,
            rate_limit_required: true,
            ai_firewall_required: true,
            error_masking_enabled: false,
            zone_rules_enabled: true,
        }
    }
}

/// Per-code status/recoverability override.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErrorCodePolicy {
    pub status: u16,
    pub recoverable: bool,
}

/// Request deadline buckets, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timeouts {
    pub default_ms: u64,
    pub long_running_ms: u64,
    pub websocket_ms: u64,
    pub health_check_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            long_running_ms: 300_000,
            websocket_ms: 3_600_000,
            health_check_ms: 5_000,
        }
    }
}

/// Retry policy advertised to clients and applied to kernel calls by
/// hosts that opt in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
            backoff_multiplier: 2.0,
        }
    }
}

/// Transport hardening flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardening {
    /// Accepted `Host` values; empty disables the check.
    pub host_whitelist: Vec<String>,
    pub strip_forwarded_headers: bool,
    /// Emit the OWASP response-header set.
    pub security_headers_enabled: bool,
    /// Emit Strict-Transport-Security.
    pub strict_transport: bool,
}

impl Default for Hardening {
    fn default() -> Self {
        Self {
            host_whitelist: vec![],
            strip_forwarded_headers: true,
            security_headers_enabled: true,
            strict_transport: false,
        }
    }
}

/// AI-firewall knobs. The prompt-injection list ships as data so
/// operators can replace it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallPolicy {
    /// Paths exempt from inspection (exact match).
    pub bypass_paths: Vec<String>,
    /// Paths whose bodies get the prompt-injection pass.
    pub ai_paths: Vec<String>,
    pub risk_threshold: f64,
    pub critical_multiplier: f64,
    pub prompt_injection_patterns: Vec<String>,
}

impl Default for FirewallPolicy {
    fn default() -> Self {
        Self {
            bypass_paths: vec!["/api/v1/health".into()],
            ai_paths: vec!["/ai/".into(), "/prompts/".into()],
            risk_threshold: 0.7,
            critical_multiplier: 2.0,
            prompt_injection_patterns: vec![
                r"(?i)ignore (all |the )?(previous|prior|above) instructions".into(),
                r"(?i)disregard (your|the) system prompt".into(),
                r"(?i)you are now (?:in )?(?:developer|dan|jailbreak) mode".into(),
                r"(?i)reveal (your|the) (system prompt|instructions)".into(),
                r"(?i)pretend (you are|to be) unrestricted".into(),
            ],
        }
    }
}

/// The single governance document. Immutable once built; the process holds
/// it behind `Arc` and reloads produce a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: String,
    pub name: String,
    pub version: String,
    pub env: Environment,
    pub protocols: BTreeMap<String, ProtocolDescriptor>,
    pub versioning: VersioningPolicy,
    pub rate_limits: RateLimits,
    pub payload_limits: PayloadLimits,
    pub required_headers: RequiredHeaders,
    pub cors: CorsMatrix,
    pub security: SecurityPolicy,
    pub enforcement: EnforcementPolicy,
    pub error_codes: BTreeMap<String, ErrorCodePolicy>,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub hardening: Hardening,
    pub ai_firewall: FirewallPolicy,
    /// `sha256-<hex>` over the canonical encoding of every other field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Manifest {
    /// The shipping baseline all overrides merge onto. Carries no
    /// signature; [`Manifest::build`](crate::Manifest::build) computes it.
    pub fn baseline() -> Self {
        Self {
            kind: "GatewayManifest".into(),
            name: "manifold".into(),
            version: "1.0.0".into(),
            env: Environment::Development,
            protocols: BTreeMap::from([
                (
                    "openapi".to_string(),
                    ProtocolDescriptor {
                        enabled: true,
                        path: "/api/v1".into(),
                    },
                ),
                (
                    "trpc".to_string(),
                    ProtocolDescriptor {
                        enabled: true,
                        path: "/trpc".into(),
                    },
                ),
                (
                    "graphql".to_string(),
                    ProtocolDescriptor {
                        enabled: true,
                        path: "/graphql".into(),
                    },
                ),
                (
                    "websocket".to_string(),
                    ProtocolDescriptor {
                        enabled: true,
                        path: "/ws".into(),
                    },
                ),
                (
                    "grpc".to_string(),
                    ProtocolDescriptor {
                        enabled: false,
                        path: "/grpc".into(),
                    },
                ),
            ]),
            versioning: VersioningPolicy::default(),
            rate_limits: RateLimits::default(),
            payload_limits: PayloadLimits::default(),
            required_headers: RequiredHeaders::default(),
            cors: CorsMatrix::default(),
            security: SecurityPolicy::default(),
            enforcement: EnforcementPolicy::default(),
            error_codes: BTreeMap::new(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            hardening: Hardening::default(),
            ai_firewall: FirewallPolicy::default(),
            signature: None,
        }
    }
}
