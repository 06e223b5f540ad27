//! Error taxonomy for the Manifold gateway.
//!
//! Every failure surfaced by the pipeline or an adapter carries an
//! [`ErrorCode`] from the fixed taxonomy. The manifest can override the
//! HTTP status and recoverability per code; the defaults here apply
//! otherwise.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// The closed set of gateway error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    AuthError,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    PayloadTooLarge,
    RateLimited,
    InternalError,
    NotImplemented,
    ServiceUnavailable,
    GatewayTimeout,
    CorsError,
    AiFirewallBlocked,
    OutputValidationFailed,
    QueryTooDeep,
    QueryTooComplex,
    TenantNotFound,
    TenantIsolationEnforced,
    EngineNotFound,
    ActionNotFound,
    ExecutionFailed,
    DriftDetected,
}

impl ErrorCode {
    /// All taxonomy codes, in declaration order.
    pub const ALL: &[ErrorCode] = &[
        ErrorCode::ValidationError,
        ErrorCode::AuthError,
        ErrorCode::Unauthorized,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::MethodNotAllowed,
        ErrorCode::Conflict,
        ErrorCode::PayloadTooLarge,
        ErrorCode::RateLimited,
        ErrorCode::InternalError,
        ErrorCode::NotImplemented,
        ErrorCode::ServiceUnavailable,
        ErrorCode::GatewayTimeout,
        ErrorCode::CorsError,
        ErrorCode::AiFirewallBlocked,
        ErrorCode::OutputValidationFailed,
        ErrorCode::QueryTooDeep,
        ErrorCode::QueryTooComplex,
        ErrorCode::TenantNotFound,
        ErrorCode::TenantIsolationEnforced,
        ErrorCode::EngineNotFound,
        ErrorCode::ActionNotFound,
        ErrorCode::ExecutionFailed,
        ErrorCode::DriftDetected,
    ];

    /// The wire representation, e.g. `RATE_LIMITED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::CorsError => "CORS_ERROR",
            ErrorCode::AiFirewallBlocked => "AI_FIREWALL_BLOCKED",
            ErrorCode::OutputValidationFailed => "OUTPUT_VALIDATION_FAILED",
            ErrorCode::QueryTooDeep => "QUERY_TOO_DEEP",
            ErrorCode::QueryTooComplex => "QUERY_TOO_COMPLEX",
            ErrorCode::TenantNotFound => "TENANT_NOT_FOUND",
            ErrorCode::TenantIsolationEnforced => "TENANT_ISOLATION_ENFORCED",
            ErrorCode::EngineNotFound => "ENGINE_NOT_FOUND",
            ErrorCode::ActionNotFound => "ACTION_NOT_FOUND",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::DriftDetected => "DRIFT_DETECTED",
        }
    }

    /// Parse the wire representation back to a code.
    pub fn parse(s: &str) -> Option<ErrorCode> {
        ErrorCode::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Default HTTP status when the manifest does not override it.
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 400,
            ErrorCode::AuthError | ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden | ErrorCode::TenantIsolationEnforced => 403,
            ErrorCode::NotFound
            | ErrorCode::TenantNotFound
            | ErrorCode::EngineNotFound
            | ErrorCode::ActionNotFound => 404,
            ErrorCode::MethodNotAllowed => 405,
            ErrorCode::Conflict => 409,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::RateLimited => 429,
            ErrorCode::InternalError | ErrorCode::ExecutionFailed => 500,
            ErrorCode::NotImplemented => 501,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::GatewayTimeout => 504,
            ErrorCode::CorsError => 403,
            ErrorCode::AiFirewallBlocked => 400,
            ErrorCode::OutputValidationFailed => 500,
            ErrorCode::QueryTooDeep | ErrorCode::QueryTooComplex => 400,
            ErrorCode::DriftDetected => 500,
        }
    }

    /// Whether a client can sensibly retry this error without changes.
    pub fn default_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::ServiceUnavailable
                | ErrorCode::GatewayTimeout
                | ErrorCode::ValidationError
                | ErrorCode::Conflict
                | ErrorCode::PayloadTooLarge
        )
    }

    /// Codes whose messages are always masked under error masking.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ErrorCode::InternalError | ErrorCode::ServiceUnavailable | ErrorCode::GatewayTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for pipeline and adapter operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// A gateway failure: a taxonomy code plus a human-readable message.
///
/// Stages never panic past the pipeline — everything terminal becomes one
/// of these and is rendered into the surface envelope by the adapter.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
    /// Seconds the client should wait before retrying (rate limit, timeout).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Debug-only context (firewall reason flags etc). Suppressed under
    /// error masking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            detail: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GatewayTimeout, message)
    }

    /// The message after applying the masking policy.
    ///
    /// When `mask` is set, internal codes and messages matching the
    /// sensitivity patterns collapse to a generic phrase. Codes and error
    /// ids are never masked.
    pub fn masked_message(&self, mask: bool) -> String {
        if mask && (self.code.is_internal() || message_is_sensitive(&self.message)) {
            MASKED_MESSAGE.to_string()
        } else {
            self.message.clone()
        }
    }
}

/// Generic phrase substituted for masked messages.
pub const MASKED_MESSAGE: &str = "An unexpected error occurred. Contact support with the error id.";

static SENSITIVE_PATTERNS: LazyLock<Vec<regex_lite::Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bsql\b",
        r"(?i)\bdatabase\b",
        r"(?i)\bpostgres\b|\bsqlite\b|\bmysql\b",
        // stack-trace shapes
        r"(?i)\bat .+:\d+:\d+",
        r"(?i)stack trace|backtrace",
        r"\.rs:\d+",
        // errno names
        r"\bE(CONNREFUSED|CONNRESET|TIMEDOUT|NOENT|ACCES|PIPE|HOSTUNREACH)\b",
    ]
    .iter()
    .map(|p| regex_lite::Regex::new(p).expect("sensitivity pattern"))
    .collect()
});

/// Whether a message matches the sensitivity regex set.
pub fn message_is_sensitive(message: &str) -> bool {
    SENSITIVE_PATTERNS.iter().any(|re| re.is_match(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wire_form() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(*code));
        }
    }

    #[test]
    fn recoverable_set_matches_taxonomy() {
        assert!(ErrorCode::RateLimited.default_recoverable());
        assert!(ErrorCode::GatewayTimeout.default_recoverable());
        assert!(ErrorCode::ValidationError.default_recoverable());
        assert!(!ErrorCode::Forbidden.default_recoverable());
        assert!(!ErrorCode::InternalError.default_recoverable());
    }

    #[test]
    fn default_statuses() {
        assert_eq!(ErrorCode::RateLimited.default_status(), 429);
        assert_eq!(ErrorCode::GatewayTimeout.default_status(), 504);
        assert_eq!(ErrorCode::CorsError.default_status(), 403);
        assert_eq!(ErrorCode::AiFirewallBlocked.default_status(), 400);
        assert_eq!(ErrorCode::EngineNotFound.default_status(), 404);
    }

    #[test]
    fn masking_hides_internal_messages() {
        let err = GatewayError::internal("connection to postgres failed");
        assert_eq!(err.masked_message(true), MASKED_MESSAGE);
        assert_eq!(err.masked_message(false), "connection to postgres failed");
    }

    #[test]
    fn masking_catches_sensitive_messages_on_any_code() {
        let err = GatewayError::validation("SQL syntax error near SELECT");
        assert_eq!(err.masked_message(true), MASKED_MESSAGE);

        let err = GatewayError::validation("field `name` is required");
        assert_eq!(err.masked_message(true), "field `name` is required");
    }

    #[test]
    fn stack_trace_shapes_are_sensitive() {
        assert!(message_is_sensitive("panicked at src/main.rs:42"));
        assert!(message_is_sensitive("ECONNREFUSED while dialing upstream"));
        assert!(!message_is_sensitive("tenant id is malformed"));
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::AiFirewallBlocked).unwrap();
        assert_eq!(json, "\"AI_FIREWALL_BLOCKED\"");
        let back: ErrorCode = serde_json::from_str("\"RATE_LIMITED\"").unwrap();
        assert_eq!(back, ErrorCode::RateLimited);
    }
}
