//! End-to-end request scenarios against the assembled router.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use base64::Engine;
use http_body_util::BodyExt;
use manifold_core::error::GatewayError;
use manifold_core::kernel::{KernelExecutor, KernelInvocation};
use manifold_core::store::{AuditCategory, AuditStatus, AuditStore, RiskLevel, verify_chain};
use manifold_gateway::Gateway;
use manifold_manifest::{DriftGuard, DriftSeverity, Manifest};
use manifold_stores::MemoryAuditStore;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Kernel double that records every invocation.
struct RecordingKernel {
    calls: Mutex<Vec<KernelInvocation>>,
}

impl RecordingKernel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl KernelExecutor for RecordingKernel {
    async fn run(&self, invocation: KernelInvocation) -> Result<Value, GatewayError> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok(json!({"status": "ok", "code": invocation.code}))
    }
}

fn bearer_for(user: &str) -> String {
    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"none"}"#);
    let payload = engine.encode(json!({"sub": user, "roles": ["user"]}).to_string());
    format!("Bearer {header}.{payload}.sig")
}

struct Harness {
    router: axum::Router,
    kernel: Arc<RecordingKernel>,
    audit: Arc<MemoryAuditStore>,
    gateway: Arc<Gateway>,
}

fn harness(patch: Option<Value>) -> Harness {
    let manifest = Manifest::build(patch.as_ref(), None).unwrap();
    let kernel = RecordingKernel::new();
    let audit = Arc::new(MemoryAuditStore::new());
    let gateway = Gateway::builder(manifest, kernel.clone())
        .with_audit_store(audit.clone())
        .build()
        .unwrap();
    Harness {
        router: gateway.router(),
        kernel,
        audit,
        gateway,
    }
}

async fn send(router: &axum::Router, request: Request<Body>) -> (u16, axum::http::HeaderMap, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

fn execute_request(tenant: &str, action: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/execute")
        .header("Host", "api")
        .header("Authorization", bearer_for("alice"))
        .header("X-Tenant-ID", tenant)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"action": action}).to_string()))
        .unwrap()
}

#[tokio::test]
async fn anonymous_health_succeeds_without_auth_or_audit() {
    let h = harness(None);
    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Host", "api")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&h.router, request).await;

    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["meta"]["protocol"], "openapi");
    assert!(body["meta"]["requestId"].is_string());
    assert!(body["meta"]["timestamp"].is_string());
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(h.kernel.call_count(), 1);
    assert_eq!(h.audit.len().await.unwrap(), 0, "health reads are not audited");
}

#[tokio::test]
async fn authenticated_execute_appends_a_chained_audit_entry() {
    let h = harness(None);
    let (status, _, body) =
        send(&h.router, execute_request("tenant-abc", "registry.listEngines()")).await;

    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["code"], "registry.listEngines()");

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.category, AuditCategory::Write);
    assert_eq!(entry.risk_level, RiskLevel::Medium);
    assert_eq!(entry.status, AuditStatus::Success);
    assert_eq!(entry.tenant_id, "tenant-abc");
    assert_eq!(entry.user_id, "alice");
    assert_eq!(entry.action, "registry.listEngines()");
    assert_eq!(entry.previous_hash, "genesis");
    assert!(verify_chain(&entries, None));

    // a second execute chains onto the first
    send(&h.router, execute_request("tenant-abc", "registry.listEngines()")).await;
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].previous_hash, entries[0].hash);
    assert!(verify_chain(&entries, None));
}

#[tokio::test]
async fn burst_cap_returns_rate_limited_with_retry_after() {
    let h = harness(Some(json!({
        "rate_limits": {"burst": {"max": 3, "window_ms": 1000}}
    })));

    for _ in 0..3 {
        let (status, _, _) =
            send(&h.router, execute_request("tenant-abc", "registry.listEngines()")).await;
        assert_eq!(status, 200);
    }

    let (status, headers, body) =
        send(&h.router, execute_request("tenant-abc", "registry.listEngines()")).await;
    assert_eq!(status, 429);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(body["error"]["recoverable"], true);
    assert_eq!(body["error"]["retryAfter"], 1);
    assert_eq!(headers.get("retry-after").unwrap(), "1");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert!(headers.contains_key("x-error-id"));
    assert_eq!(h.kernel.call_count(), 3, "the blocked request never reached the kernel");
}

#[tokio::test]
async fn cross_tenant_access_is_denied_before_the_kernel() {
    let h = harness(None);
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/tenants/tenant-xyz/engines")
        .header("Host", "api")
        .header("Authorization", bearer_for("alice"))
        .header("X-Tenant-ID", "tenant-abc")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&h.router, request).await;

    assert_eq!(status, 403);
    assert_eq!(body["error"]["code"], "TENANT_ISOLATION_ENFORCED");
    assert_eq!(h.kernel.call_count(), 0);
}

#[tokio::test]
async fn graphql_depth_violation_reports_the_exact_overage() {
    let h = harness(None); // max_depth defaults to 10

    let mut query = String::new();
    for _ in 0..15 {
        query.push_str("{ a ");
    }
    query.push_str(&"}".repeat(15));

    let request = Request::builder()
        .method("POST")
        .uri("/graphql")
        .header("Host", "api")
        .header("Authorization", bearer_for("alice"))
        .header("X-Tenant-ID", "tenant-abc")
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"query": query}).to_string()))
        .unwrap();
    let (status, _, body) = send(&h.router, request).await;

    assert_eq!(status, 400);
    assert_eq!(
        body["errors"][0]["message"],
        "Query depth 15 exceeds maximum 10"
    );
    assert_eq!(body["errors"][0]["extensions"]["code"], "QUERY_TOO_DEEP");
    assert_eq!(h.kernel.call_count(), 0);
}

#[tokio::test]
async fn immutable_header_from_client_is_rejected() {
    let h = harness(None);
    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Host", "api")
        .header("X-Kernel-Signature", "spoofed")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&h.router, request).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn rpc_surface_speaks_trpc_envelopes() {
    let h = harness(None);
    let request = Request::builder()
        .method("POST")
        .uri("/trpc/execute")
        .header("Host", "api")
        .header("Authorization", bearer_for("alice"))
        .header("X-Tenant-ID", "tenant-abc")
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"action": "system.health()"}).to_string()))
        .unwrap();
    let (status, _, body) = send(&h.router, request).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["data"]["code"], "system.health()");

    let unknown = Request::builder()
        .method("POST")
        .uri("/trpc/noSuchProcedure")
        .header("Host", "api")
        .header("Authorization", bearer_for("alice"))
        .header("X-Tenant-ID", "tenant-abc")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&h.router, unknown).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["data"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn drift_from_boot_manifest_is_critical_and_enforced() {
    let h = harness(None);
    let guard = h.gateway.drift_guard().expect("drift shield on by default");

    let reloaded = Manifest::build(
        Some(&json!({"security": {"require_auth": false}})),
        None,
    )
    .unwrap();

    let report = guard.check(&reloaded).unwrap();
    assert!(report.has_drift);
    assert_eq!(report.changed_fields, vec!["security"]);
    assert_eq!(report.severity, DriftSeverity::Critical);
    assert_eq!(report.reason_codes, vec!["SECURITY_CHANGED"]);
    assert!(guard.enforce(&reloaded).is_err());

    // an independently built guard over the same boot manifest agrees
    let standalone = DriftGuard::new(h.gateway.manifest(), None).unwrap();
    assert!(standalone.check(h.gateway.manifest()).unwrap().severity == DriftSeverity::None);
}

#[tokio::test]
async fn cors_preflight_short_circuits_with_204() {
    let h = harness(None);
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/execute")
        .header("Host", "api")
        .header("Origin", "http://localhost:3000")
        .header("Access-Control-Request-Method", "POST")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&h.router, request).await;
    assert_eq!(status, 204);
    assert!(headers.contains_key("access-control-allow-origin"));
    assert_eq!(h.kernel.call_count(), 0);
}
