//! The kernel-executor contract.
//!
//! The kernel is a black box: the gateway hands it a code string, an
//! identity, and sanitized input, and gets back a JSON result. The core
//! makes no assumptions about what `code` means semantically — for the
//! built-in routes the values are literal strings like
//! `"system.health()"` or `"registry.listEngines()"`.

use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single normalized kernel call, produced by every protocol adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInvocation {
    /// The action string, e.g. `system.health()`.
    pub code: String,
    /// Free-form execution context tag (protocol name for core routes).
    pub context: String,
    pub tenant_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl KernelInvocation {
    pub fn new(
        code: impl Into<String>,
        context: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            context: context.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// The external execution engine the gateway fronts.
///
/// Dispatch is the only place the pipeline yields control to external
/// code. Cancellation is cooperative: when the request deadline expires
/// the future is dropped.
#[async_trait]
pub trait KernelExecutor: Send + Sync {
    async fn run(&self, invocation: KernelInvocation) -> Result<Value, GatewayError>;
}
