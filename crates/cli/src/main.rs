//! The `manifold` binary: build a manifest, stand up the gateway, serve.
//!
//! The kernel behind this binary is the built-in registry kernel — enough
//! to exercise every surface end to end. Production deployments embed
//! `manifold-gateway` as a library and inject their own executor.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use manifold_adapters::ProtocolAdapter;
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::kernel::{KernelExecutor, KernelInvocation};
use manifold_gateway::Gateway;
use manifold_manifest::Manifest;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "manifold", version, about = "Manifest-governed multi-protocol gateway")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway.
    Serve {
        /// Manifest override file (TOML or JSON), merged onto defaults.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Deployment environment, overriding the manifest's `env`.
        #[arg(long)]
        env: Option<String>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Environment variable holding the manifest signing secret.
        #[arg(long)]
        manifest_secret_env: Option<String>,
    },

    /// Build and verify a manifest, printing its signature.
    Validate {
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Print the OpenAPI document for a manifest.
    Spec {
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

/// Engines the built-in kernel pretends to host.
const ENGINES: &[(&str, &str)] = &[
    ("embedding", "1.4.0"),
    ("ranking", "0.9.2"),
    ("summarize", "2.0.1"),
];

const ACTIONS: &[&str] = &[
    "system.health()",
    "registry.listEngines()",
    "registry.getEngine(\"<name>\")",
    "registry.listActions()",
];

/// Reference executor: answers the core routes from static data and
/// echoes everything else.
struct RegistryKernel {
    started_at: chrono::DateTime<chrono::Utc>,
}

impl RegistryKernel {
    fn new() -> Self {
        Self {
            started_at: chrono::Utc::now(),
        }
    }
}

#[async_trait]
impl KernelExecutor for RegistryKernel {
    async fn run(&self, invocation: KernelInvocation) -> Result<Value, GatewayError> {
        let code = invocation.code.as_str();
        if code == "system.health()" {
            let uptime = (chrono::Utc::now() - self.started_at).num_seconds();
            return Ok(json!({"status": "healthy", "uptimeSeconds": uptime}));
        }
        if code == "registry.listEngines()" {
            let engines: Vec<Value> = ENGINES
                .iter()
                .map(|(name, version)| json!({"name": name, "version": version}))
                .collect();
            return Ok(json!({"engines": engines}));
        }
        if code == "registry.listActions()" {
            return Ok(json!({"actions": ACTIONS}));
        }
        if let Some(rest) = code.strip_prefix("registry.getEngine(\"") {
            let name = rest.trim_end_matches("\")");
            return match ENGINES.iter().find(|(n, _)| *n == name) {
                Some((name, version)) => Ok(json!({"name": name, "version": version})),
                None => Err(GatewayError::new(
                    ErrorCode::EngineNotFound,
                    format!("engine {name:?} is not registered"),
                )),
            };
        }
        Ok(json!({
            "accepted": code,
            "tenant": invocation.tenant_id,
            "input": invocation.input,
        }))
    }
}

fn load_overrides(path: Option<&Path>, env: Option<&str>) -> Result<Option<Value>> {
    let mut overrides = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading manifest file {}", path.display()))?;
            let value = if path.extension().is_some_and(|e| e == "json") {
                serde_json::from_str(&raw).context("manifest file is not valid JSON")?
            } else {
                let table: toml::Value = toml::from_str(&raw).context("manifest file is not valid TOML")?;
                serde_json::to_value(table)?
            };
            Some(value)
        }
        None => None,
    };

    if let Some(env) = env {
        if !matches!(env, "development" | "staging" | "production") {
            bail!("--env must be development, staging, or production");
        }
        let patch = json!({"env": env});
        overrides = Some(match overrides {
            Some(base) => manifold_manifest::deep_merge(&base, &patch),
            None => patch,
        });
    }
    Ok(overrides)
}

fn secret_from(var: Option<&str>) -> Result<Option<String>> {
    match var {
        Some(name) => {
            let value = std::env::var(name)
                .with_context(|| format!("manifest secret variable {name} is not set"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            manifest,
            env,
            host,
            port,
            manifest_secret_env,
        } => {
            let overrides = load_overrides(manifest.as_deref(), env.as_deref())?;
            let secret = secret_from(manifest_secret_env.as_deref())?;
            let manifest = Manifest::build(overrides.as_ref(), secret.as_deref())?;

            let mut builder = Gateway::builder(manifest, Arc::new(RegistryKernel::new()));
            if let Some(secret) = &secret {
                builder = builder.with_manifest_secret(secret.clone());
            }
            let gateway = builder.build()?;

            let addr = format!("{host}:{port}");
            tokio::select! {
                result = gateway.clone().serve(&addr) => {
                    result.context("gateway server failed")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    gateway.shutdown().await;
                }
            }
            Ok(())
        }

        Command::Validate { manifest } => {
            let overrides = load_overrides(manifest.as_deref(), None)?;
            let manifest = Manifest::build(overrides.as_ref(), None)?;
            manifest.verify_signature(None)?;
            println!("name:      {}", manifest.name);
            println!("version:   {}", manifest.version);
            println!("env:       {}", manifest.env.as_str());
            println!("signature: {}", manifest.signature.as_deref().unwrap_or("-"));
            Ok(())
        }

        Command::Spec { manifest } => {
            let overrides = load_overrides(manifest.as_deref(), None)?;
            let manifest = Manifest::build(overrides.as_ref(), None)?;
            let adapter = manifold_adapters::OpenApiAdapter::new(manifest);
            let doc = adapter.describe().unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
    }
}
