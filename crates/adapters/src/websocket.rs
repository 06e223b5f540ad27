//! The WebSocket adapter.
//!
//! Transport-independent connection bookkeeping: the gateway feeds parsed
//! frames in and delivers the returned messages, so everything here is
//! testable without sockets. Per-connection message buckets, payload
//! ceilings, channel scoping, and the heartbeat reaper all live on this
//! adapter.

use async_trait::async_trait;
use manifold_core::context::{AuthContext, Protocol, RequestContext};
use manifold_core::envelope::WireResponse;
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::kernel::KernelExecutor;
use manifold_manifest::Manifest;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use uuid::Uuid;

static BLOCKED_PAYLOAD_RE: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"(?i)<script|__proto__|\beval\s*\(").expect("payload pattern")
});

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Inbound/outbound frame shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: WsMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsMessageType {
    Subscribe,
    Unsubscribe,
    Message,
    Ping,
    Pong,
    Error,
}

/// One live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub subscriptions: BTreeSet<String>,
    pub last_ping_ms: u64,
    pub created_at_ms: u64,
}

/// A registered channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelSpec {
    /// Permission required to subscribe, if any.
    pub permission: Option<String>,
}

/// What one inbound frame produced.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Message to send back on the same connection.
    pub reply: Option<WsMessage>,
    /// Channel broadcast to fan out to subscribers.
    pub broadcast: Option<(String, WsMessage)>,
}

pub struct WebsocketAdapter {
    manifest: Arc<Manifest>,
    mount: String,
    connections: RwLock<HashMap<String, Connection>>,
    /// Per-connection message-rate window: (count, window_start_ms).
    buckets: Mutex<HashMap<String, (u32, u64)>>,
    channels: HashMap<String, ChannelSpec>,
}

impl WebsocketAdapter {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        let mount = manifest.mount_path("websocket").unwrap_or("/ws").to_string();
        let channels = HashMap::from([
            ("public:announcements".to_string(), ChannelSpec::default()),
            ("events".to_string(), ChannelSpec::default()),
        ]);
        Self {
            manifest,
            mount,
            connections: RwLock::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            channels,
        }
    }

    /// Register an additional channel.
    pub fn with_channel(mut self, name: &str, spec: ChannelSpec) -> Self {
        self.channels.insert(name.into(), spec);
        self
    }

    /// Accept a connection for an authenticated context, enforcing the
    /// per-tenant cap.
    pub fn connect(&self, auth: &AuthContext) -> Result<String, GatewayError> {
        let limits = &self.manifest.rate_limits.websocket;
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());

        let tenant_count = connections
            .values()
            .filter(|c| c.tenant_id == auth.tenant_id)
            .count();
        if tenant_count >= limits.max_connections_per_tenant as usize {
            return Err(GatewayError::new(
                ErrorCode::RateLimited,
                format!(
                    "tenant {} reached the {}-connection limit",
                    auth.tenant_id, limits.max_connections_per_tenant
                ),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                tenant_id: auth.tenant_id.clone(),
                user_id: auth.user_id.clone(),
                roles: auth.roles.clone(),
                permissions: auth.permissions.clone(),
                subscriptions: BTreeSet::new(),
                last_ping_ms: now,
                created_at_ms: now,
            },
        );
        tracing::debug!(connection = %id, tenant = %auth.tenant_id, "WebSocket connected");
        Ok(id)
    }

    pub fn disconnect(&self, connection_id: &str) -> bool {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id);
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id)
            .is_some()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(connection_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Process one raw frame from `connection_id`.
    pub fn handle_frame(
        &self,
        connection_id: &str,
        raw: &str,
    ) -> Result<FrameOutcome, GatewayError> {
        self.check_message_rate(connection_id)?;
        self.check_payload(raw)?;

        let message: WsMessage = serde_json::from_str(raw)
            .map_err(|e| GatewayError::validation(format!("malformed frame: {e}")))?;

        match message.kind {
            WsMessageType::Ping => {
                self.touch(connection_id);
                Ok(FrameOutcome {
                    reply: Some(WsMessage {
                        kind: WsMessageType::Pong,
                        channel: None,
                        payload: None,
                        id: message.id,
                    }),
                    broadcast: None,
                })
            }
            WsMessageType::Pong => {
                self.touch(connection_id);
                Ok(FrameOutcome::default())
            }
            WsMessageType::Subscribe => self.subscribe(connection_id, message),
            WsMessageType::Unsubscribe => self.unsubscribe(connection_id, message),
            WsMessageType::Message => self.channel_message(connection_id, message),
            WsMessageType::Error => {
                tracing::warn!(connection = %connection_id, "Client reported an error frame");
                Ok(FrameOutcome::default())
            }
        }
    }

    fn check_message_rate(&self, connection_id: &str) -> Result<(), GatewayError> {
        let limit = self.manifest.rate_limits.websocket.messages_per_second;
        let now = now_ms();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let (count, window_start) = buckets.entry(connection_id.to_string()).or_insert((0, now));
        if now.saturating_sub(*window_start) >= 1_000 {
            *count = 0;
            *window_start = now;
        }
        *count += 1;
        if *count > limit {
            return Err(GatewayError::new(
                ErrorCode::RateLimited,
                "message rate limit exceeded",
            )
            .with_retry_after(1));
        }
        Ok(())
    }

    fn check_payload(&self, raw: &str) -> Result<(), GatewayError> {
        let limits = &self.manifest.rate_limits.websocket;
        if raw.len() > limits.max_payload_bytes {
            return Err(GatewayError::new(
                ErrorCode::PayloadTooLarge,
                format!("frame exceeds {} bytes", limits.max_payload_bytes),
            ));
        }
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for c in raw.chars() {
            match c {
                '{' | '[' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                '}' | ']' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        if max_depth > limits.max_nesting_depth {
            return Err(GatewayError::validation(format!(
                "frame nesting exceeds depth {}",
                limits.max_nesting_depth
            )));
        }
        if BLOCKED_PAYLOAD_RE.is_match(raw) {
            return Err(GatewayError::validation("frame contains a blocked pattern"));
        }
        Ok(())
    }

    fn touch(&self, connection_id: &str) {
        if let Some(conn) = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(connection_id)
        {
            conn.last_ping_ms = now_ms();
        }
    }

    /// Scoped channels (`scope:rest`) are visible when the scope is
    /// `public` or embeds the connection's tenant id; unscoped channels
    /// are global.
    fn channel_visible(channel: &str, tenant_id: &str) -> bool {
        match channel.split_once(':') {
            Some((scope, _)) => scope == "public" || scope == tenant_id || channel.contains(tenant_id),
            None => true,
        }
    }

    fn subscribe(&self, connection_id: &str, message: WsMessage) -> Result<FrameOutcome, GatewayError> {
        let channel = message
            .channel
            .ok_or_else(|| GatewayError::validation("subscribe requires a channel"))?;
        let spec = self
            .channels
            .get(&channel)
            .ok_or_else(|| GatewayError::not_found(format!("unknown channel {channel:?}")))?;

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let conn = connections
            .get_mut(connection_id)
            .ok_or_else(|| GatewayError::not_found("unknown connection"))?;

        if let Some(required) = &spec.permission {
            if !conn.permissions.contains(required) {
                return Err(GatewayError::forbidden(format!(
                    "channel {channel:?} requires the {required:?} permission"
                )));
            }
        }
        if !Self::channel_visible(&channel, &conn.tenant_id) {
            return Err(GatewayError::new(
                ErrorCode::TenantIsolationEnforced,
                format!("channel {channel:?} belongs to another tenant"),
            ));
        }

        conn.subscriptions.insert(channel.clone());
        Ok(FrameOutcome {
            reply: Some(WsMessage {
                kind: WsMessageType::Message,
                channel: Some(channel),
                payload: Some(json!({"subscribed": true})),
                id: message.id,
            }),
            broadcast: None,
        })
    }

    fn unsubscribe(
        &self,
        connection_id: &str,
        message: WsMessage,
    ) -> Result<FrameOutcome, GatewayError> {
        let channel = message
            .channel
            .ok_or_else(|| GatewayError::validation("unsubscribe requires a channel"))?;
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = connections.get_mut(connection_id) {
            conn.subscriptions.remove(&channel);
        }
        Ok(FrameOutcome::default())
    }

    fn channel_message(
        &self,
        connection_id: &str,
        message: WsMessage,
    ) -> Result<FrameOutcome, GatewayError> {
        let channel = message
            .channel
            .ok_or_else(|| GatewayError::validation("message requires a channel"))?;
        let subscribed = self
            .connection(connection_id)
            .is_some_and(|c| c.subscriptions.contains(&channel));
        if !subscribed {
            return Err(GatewayError::forbidden(format!(
                "not subscribed to channel {channel:?}"
            )));
        }
        Ok(FrameOutcome {
            reply: None,
            broadcast: Some((
                channel.clone(),
                WsMessage {
                    kind: WsMessageType::Message,
                    channel: Some(channel),
                    payload: message.payload,
                    id: message.id,
                },
            )),
        })
    }

    /// Connection ids holding a subscription to `channel`, optionally
    /// restricted to one tenant.
    pub fn subscribers(&self, channel: &str, tenant: Option<&str>) -> Vec<String> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.subscriptions.contains(channel))
            .filter(|c| tenant.is_none_or(|t| c.tenant_id == t))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Drop connections whose last ping is older than twice the
    /// heartbeat interval. Returns the reaped ids.
    pub fn reap_stale(&self) -> Vec<String> {
        let timeout = self.manifest.rate_limits.websocket.heartbeat_interval_ms * 2;
        let cutoff = now_ms().saturating_sub(timeout);
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = connections
            .values()
            .filter(|c| c.last_ping_ms < cutoff)
            .map(|c| c.id.clone())
            .collect();
        for id in &stale {
            connections.remove(id);
            tracing::info!(connection = %id, "Reaped stale WebSocket connection");
        }
        stale
    }

    /// The heartbeat interval the gateway's reaper task should run at.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.manifest.rate_limits.websocket.heartbeat_interval_ms
    }
}

#[async_trait]
impl crate::ProtocolAdapter for WebsocketAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Websocket
    }

    fn mount_path(&self) -> &str {
        &self.mount
    }

    fn describe(&self) -> Option<Value> {
        let mut channels: Vec<&String> = self.channels.keys().collect();
        channels.sort();
        Some(json!({"channels": channels, "mount": self.mount}))
    }

    async fn handle(
        &self,
        _ctx: &mut RequestContext,
        _kernel: &dyn KernelExecutor,
    ) -> Result<Value, GatewayError> {
        // Frames ride the upgraded socket, not the HTTP dispatch path.
        Err(GatewayError::validation(
            "this endpoint requires a WebSocket upgrade handshake",
        ))
    }

    fn success_response(&self, _ctx: &RequestContext, data: Value) -> WireResponse {
        WireResponse::json(200, data)
    }

    fn error_response(&self, _ctx: Option<&RequestContext>, err: &GatewayError) -> WireResponse {
        WireResponse::json(
            self.manifest.status_for(err.code),
            json!({
                "type": "error",
                "error": {"code": err.code.as_str(), "message": err.masked_message(self.manifest.mask_errors())},
            }),
        )
    }
}
