//! # Manifold Core
//!
//! Domain types, traits, and error definitions for the Manifold gateway.
//! This crate has **zero framework dependencies** — it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is defined as a trait here (the kernel
//! executor, the token validator). Implementations live in their
//! respective crates or in the host application. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod canonical;
pub mod context;
pub mod envelope;
pub mod error;
pub mod kernel;
pub mod store;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use canonical::{canonical_json, content_hash, signature};
pub use context::{AuthContext, Protocol, RateLimitState, RequestContext, ZoneDecision};
pub use envelope::{ErrorBody, ResponseMeta, StandardEnvelope, WireResponse};
pub use error::{ErrorCode, GatewayError, Result};
pub use kernel::{KernelExecutor, KernelInvocation};
pub use store::{
    AuditCategory, AuditEntry, AuditStatus, AuditStore, Bucket, RateLimitStore, RiskLevel,
    StoreError,
};
pub use token::{TokenValidation, TokenValidator};
