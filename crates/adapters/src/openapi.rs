//! The OpenAPI/REST adapter.
//!
//! A static route table keyed by (method, path-relative-to-mount) maps
//! core routes onto kernel invocations; `POST /execute` additionally runs
//! the action-string policy. The adapter can emit an OpenAPI 3.1 document
//! describing its own table.

use async_trait::async_trait;
use manifold_core::context::{Protocol, RequestContext};
use manifold_core::envelope::{ResponseMeta, StandardEnvelope, WireResponse};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::kernel::{KernelExecutor, KernelInvocation};
use manifold_manifest::Manifest;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::{actions, identity};

/// What a matched route does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteTarget {
    Health,
    Execute,
    ListEngines,
    GetEngine,
    ListActions,
    Spec,
}

struct Route {
    method: &'static str,
    /// Relative path; one `{param}` segment is supported.
    pattern: &'static str,
    target: RouteTarget,
}

const ROUTES: &[Route] = &[
    Route { method: "GET", pattern: "/health", target: RouteTarget::Health },
    Route { method: "POST", pattern: "/execute", target: RouteTarget::Execute },
    Route { method: "GET", pattern: "/engines", target: RouteTarget::ListEngines },
    Route { method: "GET", pattern: "/engines/{name}", target: RouteTarget::GetEngine },
    Route { method: "GET", pattern: "/actions", target: RouteTarget::ListActions },
    Route { method: "GET", pattern: "/openapi.json", target: RouteTarget::Spec },
];

/// Match a relative path against a route pattern, returning the captured
/// `{param}` value if the pattern has one.
fn match_pattern(pattern: &str, path: &str) -> Option<Option<String>> {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }
    let mut capture = None;
    for (p, s) in pattern_segments.iter().zip(&path_segments) {
        if p.starts_with('{') && p.ends_with('}') {
            capture = Some((*s).to_string());
        } else if p != s {
            return None;
        }
    }
    Some(capture)
}

/// REST surface over the kernel.
pub struct OpenApiAdapter {
    manifest: Arc<Manifest>,
    mount: String,
}

impl OpenApiAdapter {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        let mount = manifest
            .mount_path("openapi")
            .unwrap_or("/api/v1")
            .to_string();
        Self { manifest, mount }
    }

    /// Path relative to the mount, query string stripped.
    fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        let path = path.split('?').next().unwrap_or(path);
        let rel = path.strip_prefix(&self.mount).unwrap_or(path);
        if rel.is_empty() { "/" } else { rel }
    }

    fn resolve(&self, method: &str, rel: &str) -> Result<(RouteTarget, Option<String>), GatewayError> {
        for route in ROUTES {
            if let Some(capture) = match_pattern(route.pattern, rel) {
                if route.method == method {
                    return Ok((route.target, capture));
                }
            }
        }
        // Distinguish a wrong verb from a missing route.
        if ROUTES.iter().any(|r| match_pattern(r.pattern, rel).is_some()) {
            return Err(GatewayError::new(
                ErrorCode::MethodNotAllowed,
                format!("{method} is not allowed on {rel}"),
            ));
        }
        Err(GatewayError::not_found(format!("no route for {method} {rel}")))
    }

    fn openapi_document(&self) -> Value {
        let mut paths = serde_json::Map::new();
        for route in ROUTES {
            if route.target == RouteTarget::Spec {
                continue;
            }
            let entry = paths
                .entry(route.pattern.to_string())
                .or_insert_with(|| json!({}));
            entry[route.method.to_ascii_lowercase()] = json!({
                "operationId": format!("{:?}", route.target),
                "responses": {
                    "200": {
                        "description": "Standard envelope",
                        "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Envelope"}}}
                    }
                }
            });
        }
        json!({
            "openapi": "3.1.0",
            "info": {
                "title": self.manifest.name,
                "version": self.manifest.version,
            },
            "servers": [{"url": self.mount}],
            "paths": paths,
            "components": {
                "schemas": {
                    "Envelope": {
                        "type": "object",
                        "required": ["success", "meta"],
                        "properties": {
                            "success": {"type": "boolean"},
                            "data": {},
                            "error": {"type": "object"},
                            "meta": {"type": "object"},
                        }
                    }
                }
            }
        })
    }

    fn meta_for(&self, ctx: &RequestContext) -> ResponseMeta {
        ResponseMeta::for_request(ctx.request_id.clone(), Protocol::Openapi.as_str())
    }
}

#[async_trait]
impl crate::ProtocolAdapter for OpenApiAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Openapi
    }

    fn mount_path(&self) -> &str {
        &self.mount
    }

    fn describe(&self) -> Option<Value> {
        Some(self.openapi_document())
    }

    async fn handle(
        &self,
        ctx: &mut RequestContext,
        kernel: &dyn KernelExecutor,
    ) -> Result<Value, GatewayError> {
        let rel = self.relative_path(&ctx.path).to_string();
        let (target, capture) = self.resolve(&ctx.method, &rel)?;
        let (tenant_id, user_id) = identity(ctx);
        let input = ctx.sanitized_input.clone().or_else(|| ctx.body.clone());

        let code = match target {
            RouteTarget::Health => "system.health()".to_string(),
            RouteTarget::ListEngines => "registry.listEngines()".to_string(),
            RouteTarget::ListActions => "registry.listActions()".to_string(),
            RouteTarget::GetEngine => {
                let name = capture.ok_or_else(|| GatewayError::validation("engine name missing"))?;
                format!("registry.getEngine(\"{name}\")")
            }
            RouteTarget::Spec => return Ok(self.openapi_document()),
            RouteTarget::Execute => {
                let action = input
                    .as_ref()
                    .and_then(|b| b.get("action"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::validation("request body must carry an \"action\" string")
                    })?
                    .to_string();
                actions::validate_action(&self.manifest, &action)?;
                action
            }
        };

        let mut invocation =
            KernelInvocation::new(code, Protocol::Openapi.as_str(), tenant_id, user_id);
        if target == RouteTarget::Execute {
            if let Some(extra) = input.as_ref().and_then(|b| b.get("input")) {
                invocation = invocation.with_input(extra.clone());
            }
        }
        kernel.run(invocation).await
    }

    fn success_response(&self, ctx: &RequestContext, data: Value) -> WireResponse {
        let envelope = StandardEnvelope::ok(data, self.meta_for(ctx));
        WireResponse::json(200, serde_json::to_value(envelope).unwrap_or_default())
    }

    fn error_response(&self, ctx: Option<&RequestContext>, err: &GatewayError) -> WireResponse {
        let meta = match ctx {
            Some(ctx) => ResponseMeta {
                path: Some(ctx.path.clone()),
                method: Some(ctx.method.clone()),
                duration: Some(ctx.elapsed_ms()),
                ..self.meta_for(ctx)
            },
            None => ResponseMeta::now(),
        };
        let envelope = StandardEnvelope::fail(
            err,
            self.manifest.recoverable_for(err.code),
            self.manifest.mask_errors(),
            meta,
        );
        WireResponse::json(
            self.manifest.status_for(err.code),
            serde_json::to_value(envelope).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolAdapter;
    use std::collections::HashMap;

    struct RecordingKernel {
        calls: std::sync::Mutex<Vec<KernelInvocation>>,
    }

    impl RecordingKernel {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KernelExecutor for RecordingKernel {
        async fn run(&self, invocation: KernelInvocation) -> Result<Value, GatewayError> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(json!({"echo": invocation.code}))
        }
    }

    fn ctx(method: &str, path: &str) -> RequestContext {
        let mut ctx =
            RequestContext::new(method, path, HashMap::new(), HashMap::new(), Protocol::Openapi);
        ctx.request_id = "req-1".into();
        ctx
    }

    fn adapter() -> OpenApiAdapter {
        OpenApiAdapter::new(Manifest::build(None, None).unwrap())
    }

    #[tokio::test]
    async fn health_route_invokes_the_health_action() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("GET", "/api/v1/health");
        let data = adapter.handle(&mut ctx, &kernel).await.unwrap();
        assert_eq!(data["echo"], "system.health()");
        let calls = kernel.calls.lock().unwrap();
        assert_eq!(calls[0].tenant_id, "anonymous");
        assert_eq!(calls[0].context, "openapi");
    }

    #[tokio::test]
    async fn engine_route_captures_the_name() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("GET", "/api/v1/engines/embedding");
        adapter.handle(&mut ctx, &kernel).await.unwrap();
        assert_eq!(
            kernel.calls.lock().unwrap()[0].code,
            "registry.getEngine(\"embedding\")"
        );
    }

    #[tokio::test]
    async fn query_strings_are_stripped_before_matching() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("GET", "/api/v1/engines?verbose=1");
        adapter.handle(&mut ctx, &kernel).await.unwrap();
        assert_eq!(kernel.calls.lock().unwrap()[0].code, "registry.listEngines()");
    }

    #[tokio::test]
    async fn execute_forwards_whitelisted_actions_with_input() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("POST", "/api/v1/execute");
        ctx.sanitized_input = Some(json!({
            "action": "registry.listEngines()",
            "input": {"limit": 5},
        }));
        adapter.handle(&mut ctx, &kernel).await.unwrap();
        let calls = kernel.calls.lock().unwrap();
        assert_eq!(calls[0].code, "registry.listEngines()");
        assert_eq!(calls[0].input.as_ref().unwrap()["limit"], 5);
    }

    #[tokio::test]
    async fn execute_without_action_fails_before_the_kernel() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("POST", "/api/v1/execute");
        ctx.sanitized_input = Some(json!({"input": {}}));
        let err = adapter.handle(&mut ctx, &kernel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(kernel.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_action_never_reaches_the_kernel() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("POST", "/api/v1/execute");
        ctx.sanitized_input = Some(json!({"action": "DROP TABLE engines"}));
        let err = adapter.handle(&mut ctx, &kernel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
        assert!(kernel.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_404_and_wrong_verb_is_405() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();

        let mut missing = ctx("GET", "/api/v1/nope");
        assert_eq!(
            adapter.handle(&mut missing, &kernel).await.unwrap_err().code,
            ErrorCode::NotFound
        );

        let mut wrong_verb = ctx("DELETE", "/api/v1/health");
        assert_eq!(
            adapter.handle(&mut wrong_verb, &kernel).await.unwrap_err().code,
            ErrorCode::MethodNotAllowed
        );
    }

    #[tokio::test]
    async fn spec_route_returns_the_document() {
        let adapter = adapter();
        let kernel = RecordingKernel::new();
        let mut ctx = ctx("GET", "/api/v1/openapi.json");
        let doc = adapter.handle(&mut ctx, &kernel).await.unwrap();
        assert_eq!(doc["openapi"], "3.1.0");
        assert!(doc["paths"]["/health"]["get"].is_object());
        assert!(doc["paths"]["/engines/{name}"]["get"].is_object());
        assert!(kernel.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn envelopes_follow_the_standard_shape() {
        let adapter = adapter();
        let ctx = ctx("GET", "/api/v1/health");

        let ok = adapter.success_response(&ctx, json!({"status": "ok"}));
        assert_eq!(ok.status, 200);
        let body = ok.body.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["meta"]["protocol"], "openapi");
        assert_eq!(body["meta"]["requestId"], "req-1");

        let err = adapter.error_response(Some(&ctx), &GatewayError::not_found("missing"));
        assert_eq!(err.status, 404);
        let body = err.body.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert!(body["error"]["errorId"].is_string());
    }

    #[test]
    fn production_masks_internal_messages() {
        let manifest = Manifest::build(Some(&json!({"env": "production"})), None).unwrap();
        let adapter = OpenApiAdapter::new(manifest);
        let ctx = ctx("GET", "/api/v1/health");
        let resp = adapter.error_response(Some(&ctx), &GatewayError::internal("db exploded"));
        let body = resp.body.unwrap();
        assert_ne!(body["error"]["message"], "db exploded");
    }
}
