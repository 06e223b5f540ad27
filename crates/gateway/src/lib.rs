//! Gateway assembly for Manifold.
//!
//! Owns the process-wide tables (manifest, adapter registry, stores,
//! WebSocket senders) and glues the pieces together per request:
//!
//! ```text
//! axum → resolve adapter by mount → pipeline pre → adapter handle
//!      → pipeline post → surface envelope
//! ```
//!
//! Every request runs under a deadline from the manifest timeout buckets
//! (`/health` paths get the health bucket, an `X-Long-Running: true`
//! header selects the long-running bucket). Deadline expiry synthesizes
//! `GATEWAY_TIMEOUT` and finalizes the pending audit entry with
//! status `error`.
//!
//! Built on Axum for high performance async HTTP.

use axum::Router;
use axum::extract::ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use manifold_adapters::{
    AdapterRegistry, GraphqlAdapter, OpenApiAdapter, ProtocolAdapter, RpcAdapter, WebsocketAdapter,
};
use manifold_core::context::RequestContext;
use manifold_core::envelope::{ResponseMeta, StandardEnvelope, WireResponse};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::kernel::KernelExecutor;
use manifold_core::store::{AuditStore, RateLimitStore};
use manifold_core::token::{DefaultTokenValidator, TokenValidator};
use manifold_manifest::{DriftGuard, Manifest, TimeoutBucket};
use manifold_pipeline::{Pipeline, PreOutcome};
use manifold_stores::{MemoryAuditStore, MemoryRateLimitStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// The assembled gateway. One per process; everything request-scoped
/// lives in the pipeline context, never here.
pub struct Gateway {
    manifest: Arc<Manifest>,
    kernel: Arc<dyn KernelExecutor>,
    pipeline: Arc<Pipeline>,
    registry: AdapterRegistry,
    websocket: Arc<WebsocketAdapter>,
    drift: Option<Arc<DriftGuard>>,
    ws_senders: tokio::sync::RwLock<HashMap<String, mpsc::Sender<String>>>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Builder for [`Gateway`] with pluggable stores and validator.
pub struct GatewayBuilder {
    manifest: Arc<Manifest>,
    kernel: Arc<dyn KernelExecutor>,
    rate_limits: Option<Arc<dyn RateLimitStore>>,
    audit: Option<Arc<dyn AuditStore>>,
    validator: Option<Arc<dyn TokenValidator>>,
    manifest_secret: Option<String>,
}

impl GatewayBuilder {
    pub fn with_rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limits = Some(store);
        self
    }

    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(store);
        self
    }

    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Secret for the drift guard's signature comparisons.
    pub fn with_manifest_secret(mut self, secret: impl Into<String>) -> Self {
        self.manifest_secret = Some(secret.into());
        self
    }

    pub fn build(self) -> Result<Arc<Gateway>, manifold_manifest::drift::DriftError> {
        let manifest = self.manifest;
        let rate_limits = self
            .rate_limits
            .unwrap_or_else(|| Arc::new(MemoryRateLimitStore::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(MemoryAuditStore::new()));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(DefaultTokenValidator::new()));

        let pipeline = Arc::new(Pipeline::new(
            manifest.clone(),
            rate_limits,
            audit,
            validator,
        ));

        let websocket = Arc::new(WebsocketAdapter::new(manifest.clone()));
        let mut registry = AdapterRegistry::new();
        for (name, descriptor) in &manifest.protocols {
            if !descriptor.enabled {
                continue;
            }
            match name.as_str() {
                "openapi" => registry.register(Arc::new(OpenApiAdapter::new(manifest.clone()))),
                "trpc" => registry.register(Arc::new(RpcAdapter::new(manifest.clone()))),
                "graphql" => registry.register(Arc::new(GraphqlAdapter::new(manifest.clone()))),
                "websocket" => registry.register(websocket.clone()),
                other => warn!(protocol = other, "No adapter for enabled protocol, skipping"),
            }
        }

        let drift = if manifest.enforcement.drift_shield_required {
            Some(Arc::new(DriftGuard::new(
                &manifest,
                self.manifest_secret.as_deref(),
            )?))
        } else {
            None
        };

        Ok(Arc::new(Gateway {
            manifest,
            kernel: self.kernel,
            pipeline,
            registry,
            websocket,
            drift,
            ws_senders: tokio::sync::RwLock::new(HashMap::new()),
            reaper: Mutex::new(None),
        }))
    }
}

impl Gateway {
    pub fn builder(manifest: Arc<Manifest>, kernel: Arc<dyn KernelExecutor>) -> GatewayBuilder {
        GatewayBuilder {
            manifest,
            kernel,
            rate_limits: None,
            audit: None,
            validator: None,
            manifest_secret: None,
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn drift_guard(&self) -> Option<&Arc<DriftGuard>> {
        self.drift.as_ref()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Build the axum router: the WebSocket mount gets its upgrade
    /// route, everything else flows through the fallback dispatcher.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new();
        if let Some(ws_path) = self.manifest.mount_path("websocket") {
            router = router.route(ws_path, get(ws_upgrade_handler));
        }
        router
            .fallback(dispatch_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until the listener fails or shutdown is requested.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<(), std::io::Error> {
        self.spawn_reaper();
        let app = self.router();
        info!(addr, "Gateway starting");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await
    }

    /// Start the heartbeat reaper task (idempotent).
    pub fn spawn_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let websocket = self.websocket.clone();
        let interval = Duration::from_millis(websocket.heartbeat_interval_ms().max(1_000));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = websocket.reap_stale();
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "Reaped stale WebSocket connections");
                }
            }
        }));
    }

    /// Stop background tasks and drop live WebSocket senders.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.ws_senders.write().await.clear();
        info!("Gateway shut down");
    }

    fn timeout_bucket(&self, ctx: &RequestContext) -> TimeoutBucket {
        if ctx.path.ends_with("/health") {
            TimeoutBucket::HealthCheck
        } else if ctx
            .header("x-long-running")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            TimeoutBucket::LongRunning
        } else {
            TimeoutBucket::Default
        }
    }

    /// Full request lifecycle for the HTTP surfaces.
    pub async fn handle_http(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
        body: &[u8],
    ) -> WireResponse {
        let Some(adapter) = self.registry.by_path(path) else {
            return unrouted_response(&self.manifest, path);
        };
        let adapter = adapter.clone();

        let mut ctx = RequestContext::new(method, path, headers, query, adapter.protocol());
        let deadline = Duration::from_millis(self.manifest.timeout_ms(self.timeout_bucket(&ctx)));

        enum Inner {
            Short(WireResponse),
            Data(Value),
        }

        let outcome = tokio::time::timeout(deadline, async {
            match self.pipeline.run_pre(&mut ctx, body).await? {
                PreOutcome::ShortCircuit(response) => Ok(Inner::Short(response)),
                PreOutcome::Continue => {
                    let data = adapter.handle(&mut ctx, self.kernel.as_ref()).await?;
                    self.pipeline.check_output(&data)?;
                    Ok(Inner::Data(data))
                }
            }
        })
        .await;

        let (result, timed_out) = match outcome {
            Ok(Ok(Inner::Short(response))) => return response,
            Ok(Ok(Inner::Data(data))) => (Ok(data), false),
            Ok(Err(err)) => (Err(err), false),
            Err(_) => (
                Err(GatewayError::timeout(format!(
                    "request exceeded the {}ms deadline",
                    deadline.as_millis()
                ))
                .with_retry_after(self.manifest.retry.backoff_ms.div_ceil(1000).max(1))),
                true,
            ),
        };

        match result {
            Ok(data) => {
                let mut response = adapter.success_response(&ctx, data);
                response
                    .headers
                    .extend(self.pipeline.response_headers(&ctx, None));
                self.pipeline
                    .finalize_audit(&ctx, response.status, None, false)
                    .await;
                response
            }
            Err(err) => {
                let exceptional = timed_out || err.code == ErrorCode::InternalError;
                let mut response = adapter.error_response(Some(&ctx), &err);
                let error_id = response
                    .body
                    .as_ref()
                    .and_then(|b| b.get("error"))
                    .and_then(|e| e.get("errorId"))
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                response
                    .headers
                    .extend(self.pipeline.response_headers(&ctx, Some(&error_id)));
                if let Some(retry) = err.retry_after {
                    response.headers.push(("retry-after".into(), retry.to_string()));
                }
                self.pipeline
                    .finalize_audit(&ctx, response.status, Some(err.code.as_str()), exceptional)
                    .await;
                response
            }
        }
    }

    async fn serve_socket(self: Arc<Self>, socket: WebSocket, ctx: RequestContext) {
        let Some(auth) = ctx.auth.clone() else {
            return;
        };
        let connection_id = match self.websocket.connect(&auth) {
            Ok(id) => id,
            Err(err) => {
                let (mut sink, _) = socket.split();
                let frame = serde_json::json!({
                    "type": "error",
                    "error": {"code": err.code.as_str(), "message": err.message},
                })
                .to_string();
                let _ = sink.send(AxumWsMessage::Text(frame.into())).await;
                let _ = sink.close().await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(64);
        self.ws_senders
            .write()
            .await
            .insert(connection_id.clone(), tx.clone());

        let (mut sink, mut stream) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(AxumWsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(frame)) = stream.next().await {
            let text = match frame {
                AxumWsMessage::Text(text) => text.to_string(),
                AxumWsMessage::Close(_) => break,
                _ => continue,
            };
            match self.websocket.handle_frame(&connection_id, &text) {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        let _ = tx
                            .send(serde_json::to_string(&reply).unwrap_or_default())
                            .await;
                    }
                    if let Some((channel, message)) = outcome.broadcast {
                        let frame = serde_json::to_string(&message).unwrap_or_default();
                        let subscribers = self.websocket.subscribers(&channel, None);
                        let senders = self.ws_senders.read().await;
                        for subscriber in subscribers {
                            if let Some(sender) = senders.get(&subscriber) {
                                let _ = sender.send(frame.clone()).await;
                            }
                        }
                    }
                }
                Err(err) => {
                    let frame = serde_json::json!({
                        "type": "error",
                        "error": {
                            "code": err.code.as_str(),
                            "message": err.masked_message(self.manifest.mask_errors()),
                        },
                    })
                    .to_string();
                    let _ = tx.send(frame).await;
                }
            }
        }

        self.websocket.disconnect(&connection_id);
        self.ws_senders.write().await.remove(&connection_id);
        writer.abort();
    }
}

/// Envelope for paths no adapter claims.
fn unrouted_response(manifest: &Manifest, path: &str) -> WireResponse {
    let err = GatewayError::not_found(format!("no protocol mounted at {path}"));
    let envelope = StandardEnvelope::fail(
        &err,
        manifest.recoverable_for(err.code),
        manifest.mask_errors(),
        ResponseMeta::now(),
    );
    WireResponse::json(
        manifest.status_for(err.code),
        serde_json::to_value(envelope).unwrap_or_default(),
    )
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn query_map(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn into_axum_response(wire: WireResponse) -> Response {
    let status = StatusCode::from_u16(wire.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = match wire.body {
        Some(body) => (status, axum::Json(body)).into_response(),
        None => status.into_response(),
    };
    for (name, value) in wire.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn dispatch_handler(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let limit = gateway.manifest.payload_limits.max_request_bytes;

    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let err = GatewayError::new(
                ErrorCode::PayloadTooLarge,
                format!("request body exceeds {limit} bytes"),
            );
            let envelope = StandardEnvelope::fail(
                &err,
                gateway.manifest.recoverable_for(err.code),
                gateway.manifest.mask_errors(),
                ResponseMeta::now(),
            );
            return into_axum_response(WireResponse::json(
                gateway.manifest.status_for(err.code),
                serde_json::to_value(envelope).unwrap_or_default(),
            ));
        }
    };

    let wire = gateway
        .handle_http(
            parts.method.as_str(),
            parts.uri.path(),
            header_map(&parts.headers),
            query_map(parts.uri.query()),
            &bytes,
        )
        .await;
    into_axum_response(wire)
}

async fn ws_upgrade_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let path = gateway
        .manifest
        .mount_path("websocket")
        .unwrap_or("/ws")
        .to_string();
    let mut ctx = RequestContext::new(
        "GET",
        path,
        header_map(&headers),
        HashMap::new(),
        manifold_core::context::Protocol::Websocket,
    );

    match gateway.pipeline.run_pre(&mut ctx, b"").await {
        Ok(_) => {
            let gateway = gateway.clone();
            upgrade.on_upgrade(move |socket| gateway.serve_socket(socket, ctx))
        }
        Err(err) => {
            let wire = gateway.websocket.error_response(Some(&ctx), &err);
            into_axum_response(wire)
        }
    }
}
