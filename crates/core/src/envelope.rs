//! Response envelope shapes.
//!
//! Every surface wraps results the same way at heart: a standard
//! success/error envelope plus protocol-specific renderings (JSON-RPC,
//! MCP, LLM-friendly, SSE). Producers and parsers are kept side by side so
//! the round-trip property is easy to test.

use crate::error::{ErrorCode, GatewayError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Metadata attached to every response, success or error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// ISO-8601 emission time.
    pub timestamp: String,
    /// Milliseconds spent in the gateway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl ResponseMeta {
    /// A meta block stamped with the current time and nothing else.
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    pub fn for_request(request_id: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            protocol: Some(protocol.into()),
            ..Self::now()
        }
    }
}

/// The error half of the standard envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Unique per occurrence; never masked.
    pub error_id: String,
    /// Debug-only reason flags, suppressed under masking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorBody {
    /// Render a [`GatewayError`]. `recoverable` overrides the taxonomy
    /// default (the manifest error-code table may do so); `mask` applies
    /// the production masking policy to message and detail.
    pub fn from_error(err: &GatewayError, recoverable: Option<bool>, mask: bool) -> Self {
        Self {
            code: err.code,
            message: err.masked_message(mask),
            recoverable: recoverable.unwrap_or_else(|| err.code.default_recoverable()),
            retry_after: err.retry_after,
            error_id: Uuid::new_v4().to_string(),
            detail: if mask { None } else { err.detail.clone() },
        }
    }
}

/// The uniform `{success, data|error, meta}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub meta: ResponseMeta,
}

impl StandardEnvelope {
    pub fn ok(data: Value, meta: ResponseMeta) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta,
        }
    }

    pub fn fail(err: &GatewayError, recoverable: Option<bool>, mask: bool, meta: ResponseMeta) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody::from_error(err, recoverable, mask)),
            meta,
        }
    }
}

/// A surface-neutral wire response: the adapter decides the body shape,
/// the pipeline decorates status and headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl WireResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }
}

// ── JSON-RPC ──────────────────────────────────────────────────────────────

/// Map a taxonomy code to the JSON-RPC 2.0 numeric space.
pub fn json_rpc_code(code: ErrorCode) -> i64 {
    match code {
        ErrorCode::ValidationError => -32602,
        ErrorCode::NotFound
        | ErrorCode::ActionNotFound
        | ErrorCode::EngineNotFound
        | ErrorCode::TenantNotFound => -32601,
        ErrorCode::InternalError | ErrorCode::ExecutionFailed => -32603,
        ErrorCode::AuthError | ErrorCode::Unauthorized => -32001,
        ErrorCode::Forbidden | ErrorCode::TenantIsolationEnforced => -32003,
        ErrorCode::RateLimited => -32029,
        _ => -32000,
    }
}

/// Produce a JSON-RPC 2.0 error response. The taxonomy code travels in
/// `error.data.code` so it survives the numeric flattening.
pub fn json_rpc_error(err: &GatewayError, id: Option<&Value>, mask: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {
            "code": json_rpc_code(err.code),
            "message": err.masked_message(mask),
            "data": {
                "code": err.code.as_str(),
                "httpStatus": err.code.default_status(),
            }
        }
    })
}

/// Reverse [`json_rpc_error`].
pub fn parse_json_rpc(value: &Value) -> Option<GatewayError> {
    let error = value.get("error")?;
    let code = error
        .get("data")
        .and_then(|d| d.get("code"))
        .and_then(Value::as_str)
        .and_then(ErrorCode::parse)?;
    let message = error.get("message").and_then(Value::as_str)?.to_string();
    Some(GatewayError::new(code, message))
}

// ── MCP ───────────────────────────────────────────────────────────────────

/// Produce an MCP-shaped error message.
pub fn mcp_error(err: &GatewayError, id: Option<&Value>, mask: bool) -> Value {
    let mut out = json!({
        "type": "error",
        "error": {
            "code": err.code.as_str(),
            "message": err.masked_message(mask),
        }
    });
    if let Some(id) = id {
        out["id"] = id.clone();
    }
    out
}

/// Reverse [`mcp_error`].
pub fn parse_mcp(value: &Value) -> Option<GatewayError> {
    if value.get("type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let error = value.get("error")?;
    let code = error.get("code").and_then(Value::as_str).and_then(ErrorCode::parse)?;
    let message = error.get("message").and_then(Value::as_str)?.to_string();
    Some(GatewayError::new(code, message))
}

// ── Standard parser ───────────────────────────────────────────────────────

/// Reverse the standard error envelope back to a [`GatewayError`].
pub fn parse_standard(value: &Value) -> Option<GatewayError> {
    if value.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    let error = value.get("error")?;
    let code = error.get("code").and_then(Value::as_str).and_then(ErrorCode::parse)?;
    let message = error.get("message").and_then(Value::as_str)?.to_string();
    let mut err = GatewayError::new(code, message);
    if let Some(retry) = error.get("retryAfter").and_then(Value::as_u64) {
        err = err.with_retry_after(retry);
    }
    Some(err)
}

// ── LLM-friendly ──────────────────────────────────────────────────────────

/// An error rendering aimed at LLM tool-callers: natural-language fields
/// instead of codes.
pub fn llm_error(err: &GatewayError, mask: bool) -> Value {
    let message = err.masked_message(mask);
    json!({
        "error": true,
        "summary": format!("{} ({})", message, err.code.as_str()),
        "whatHappened": message,
        "howToFix": llm_hint(err.code),
        "canRetry": err.code.default_recoverable(),
    })
}

fn llm_hint(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::RateLimited => "Wait for the retry-after interval, then resend the request.",
        ErrorCode::ValidationError => "Check the request body against the documented schema and resend.",
        ErrorCode::Unauthorized | ErrorCode::AuthError => "Provide a valid Authorization header.",
        ErrorCode::Forbidden | ErrorCode::TenantIsolationEnforced => {
            "This identity does not have access to the resource. Use the owning tenant's credentials."
        }
        ErrorCode::GatewayTimeout | ErrorCode::ServiceUnavailable => {
            "The backend did not respond in time. Retry later."
        }
        _ => "Inspect the error message and adjust the request.",
    }
}

// ── SSE ───────────────────────────────────────────────────────────────────

/// Render an error envelope as a Server-Sent Events frame.
pub fn sse_error(envelope: &StandardEnvelope) -> String {
    let data = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".into());
    format!("event: error\ndata: {data}\n\n")
}
