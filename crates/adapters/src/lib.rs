//! Protocol adapters for the Manifold gateway.
//!
//! Every surface translates its wire format into one normalized kernel
//! invocation and wraps the result back into its own envelope. The
//! gateway indexes adapters by protocol name and dispatches by mount
//! path.

pub mod actions;
pub mod graphql;
pub mod openapi;
pub mod rpc;
pub mod websocket;

pub use graphql::GraphqlAdapter;
pub use openapi::OpenApiAdapter;
pub use rpc::RpcAdapter;
pub use websocket::WebsocketAdapter;

use async_trait::async_trait;
use manifold_core::context::{Protocol, RequestContext};
use manifold_core::envelope::WireResponse;
use manifold_core::error::GatewayError;
use manifold_core::kernel::KernelExecutor;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The capability set shared by all four surfaces.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Mount path from the manifest, e.g. `/api/v1`.
    fn mount_path(&self) -> &str;

    /// Whether the adapter can accept traffic.
    fn ready(&self) -> bool {
        true
    }

    /// Self-description document (OpenAPI spec, GraphQL SDL), if the
    /// surface has one.
    fn describe(&self) -> Option<Value> {
        None
    }

    /// Translate the request into kernel invocations and return the raw
    /// result data.
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        kernel: &dyn KernelExecutor,
    ) -> Result<Value, GatewayError>;

    /// Wrap result data in the surface envelope.
    fn success_response(&self, ctx: &RequestContext, data: Value) -> WireResponse;

    /// Wrap a failure in the surface envelope. `ctx` is absent when the
    /// request died before a context existed.
    fn error_response(&self, ctx: Option<&RequestContext>, err: &GatewayError) -> WireResponse;
}

/// Name-keyed adapter registry, built once at boot and read-only after.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProtocolAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        let name = adapter.protocol().as_str().to_string();
        tracing::info!(protocol = %name, mount = %adapter.mount_path(), "Registered adapter");
        self.adapters.insert(name, adapter);
    }

    pub fn get(&self, protocol: &str) -> Option<&Arc<dyn ProtocolAdapter>> {
        self.adapters.get(protocol)
    }

    /// The adapter whose mount path prefixes `path`, longest mount wins.
    pub fn by_path(&self, path: &str) -> Option<&Arc<dyn ProtocolAdapter>> {
        self.adapters
            .values()
            .filter(|a| {
                let mount = a.mount_path();
                path == mount || path.starts_with(&format!("{mount}/"))
            })
            .max_by_key(|a| a.mount_path().len())
    }

    pub fn list(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Tenant/user pair for a kernel call, read from the request context.
pub(crate) fn identity(ctx: &RequestContext) -> (String, String) {
    match &ctx.auth {
        Some(auth) => (auth.tenant_id.clone(), auth.user_id.clone()),
        None => ("anonymous".into(), "anonymous".into()),
    }
}
