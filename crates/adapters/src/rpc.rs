//! The typed-RPC adapter (tRPC-shaped wire format).
//!
//! The procedure is the last path segment under the mount. Input arrives
//! as the POST body or the `input` query parameter; results come back as
//! `{result: {data}}`, failures as the tRPC error object with the
//! taxonomy code tucked into `error.data`.

use async_trait::async_trait;
use manifold_core::context::{Protocol, RequestContext};
use manifold_core::envelope::{WireResponse, json_rpc_code};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::kernel::{KernelExecutor, KernelInvocation};
use manifold_manifest::Manifest;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::{actions, identity};

/// Procedures the adapter exposes.
const PROCEDURES: &[&str] = &["health", "execute", "listEngines", "getEngine", "listActions"];

pub struct RpcAdapter {
    manifest: Arc<Manifest>,
    mount: String,
}

impl RpcAdapter {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        let mount = manifest.mount_path("trpc").unwrap_or("/trpc").to_string();
        Self { manifest, mount }
    }

    fn procedure<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.split('?').next().unwrap_or(path);
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// POST body wins; the `input` query param is the GET fallback.
    fn input_of(&self, ctx: &RequestContext) -> Option<Value> {
        if let Some(body) = ctx.sanitized_input.clone().or_else(|| ctx.body.clone()) {
            return Some(body);
        }
        ctx.query.get("input").map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        })
    }
}

#[async_trait]
impl crate::ProtocolAdapter for RpcAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Trpc
    }

    fn mount_path(&self) -> &str {
        &self.mount
    }

    fn describe(&self) -> Option<Value> {
        Some(json!({
            "procedures": PROCEDURES,
            "mount": self.mount,
        }))
    }

    async fn handle(
        &self,
        ctx: &mut RequestContext,
        kernel: &dyn KernelExecutor,
    ) -> Result<Value, GatewayError> {
        let procedure = self
            .procedure(&ctx.path)
            .filter(|p| PROCEDURES.contains(p))
            .ok_or_else(|| GatewayError::not_found("unknown procedure"))?
            .to_string();

        let (tenant_id, user_id) = identity(ctx);
        let input = self.input_of(ctx);

        let code = match procedure.as_str() {
            "health" => "system.health()".to_string(),
            "listEngines" => "registry.listEngines()".to_string(),
            "listActions" => "registry.listActions()".to_string(),
            "getEngine" => {
                let name = input
                    .as_ref()
                    .and_then(|i| i.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::validation("getEngine requires input.name"))?;
                format!("registry.getEngine(\"{name}\")")
            }
            "execute" => {
                let action = input
                    .as_ref()
                    .and_then(|i| i.get("action"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::validation("execute requires input.action"))?
                    .to_string();
                actions::validate_action(&self.manifest, &action)?;
                action
            }
            _ => unreachable!("procedure list is closed"),
        };

        let mut invocation =
            KernelInvocation::new(code, Protocol::Trpc.as_str(), tenant_id, user_id);
        if procedure == "execute" {
            if let Some(extra) = input.as_ref().and_then(|i| i.get("input")) {
                invocation = invocation.with_input(extra.clone());
            }
        }
        kernel.run(invocation).await
    }

    fn success_response(&self, _ctx: &RequestContext, data: Value) -> WireResponse {
        WireResponse::json(200, json!({"result": {"data": data}}))
    }

    fn error_response(&self, _ctx: Option<&RequestContext>, err: &GatewayError) -> WireResponse {
        let http_status = self.manifest.status_for(err.code);
        let wire_status = if matches!(
            err.code,
            ErrorCode::NotFound
                | ErrorCode::ActionNotFound
                | ErrorCode::EngineNotFound
                | ErrorCode::TenantNotFound
        ) {
            404
        } else {
            500
        };
        WireResponse::json(
            wire_status,
            json!({
                "error": {
                    "code": json_rpc_code(err.code),
                    "message": err.masked_message(self.manifest.mask_errors()),
                    "data": {
                        "code": err.code.as_str(),
                        "httpStatus": http_status,
                    }
                }
            }),
        )
    }
}
