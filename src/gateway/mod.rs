//! Socket gateway: admission, per-connection tasks and fan-out.
//!
//! # Architecture
//!
//! The gateway listens on the websocket port and, per accepted socket,
//! runs three tasks: an inbound reader (frame validation and dispatch), an
//! outbound writer (drains the session's bounded queue into the sink) and
//! a heartbeat ticker (detects missed heartbeats and closes failed
//! sessions). Teardown cancels them in reader -> engine -> writer order.
//!
//! Cross-node fan-out rides the KV pub/sub: publishing appends to the
//! stream log, then notifies the channel's subscribers on every node; each
//! node delivers to its own sockets and ignores its own notifications.

pub mod frames;
pub mod session;

mod dispatch;

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::auth::{Authenticator, HandshakeCredentials};
use crate::core::collab::CollaborationEngine;
use crate::core::connection::ConnectionManager;
use crate::core::domain::{
    AuditAction, AuditRecord, ChannelName, ClientType, Event, NodeId, SessionId, TenantContext,
};
use crate::core::kv::{KvStore, PubSub};
use crate::core::limiter::RateLimiter;
use crate::core::log::{stream_key, EventLog};
use crate::core::registry::ServerRegistry;
use crate::core::router::Router;
use crate::core::store::Store;
use crate::error::{Error, Result};

use frames::ServerFrame;
use session::SessionHandle;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_host: String,
    pub ws_port: u16,
    /// Node-local socket ceiling.
    pub max_connections: usize,
    pub outbound_queue: usize,
    /// Default entry count for replay requests.
    pub replay_count: usize,
    /// Per-channel stream trim threshold.
    pub stream_trim: usize,
    pub join_feature_rooms: bool,
    /// Grace period for CLOSE_GOING_AWAY on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            ws_port: 8081,
            max_connections: 10_000,
            outbound_queue: session::DEFAULT_QUEUE_CAPACITY,
            replay_count: 50,
            stream_trim: 1000,
            join_feature_rooms: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// The socket edge of the server.
pub struct Gateway {
    pub auth: Arc<Authenticator>,
    pub limiter: Arc<RateLimiter>,
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<Router>,
    pub engine: Arc<CollaborationEngine>,
    pub log: Arc<dyn EventLog>,
    pub kv: Arc<dyn KvStore>,
    pub pubsub: Arc<dyn PubSub>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ServerRegistry>,
    pub config: GatewayConfig,
    pub(crate) node_id: NodeId,
    pub(crate) sessions: DashMap<String, Arc<SessionHandle>>,
    /// Channels with an active cross-node fan-out pump.
    remote_channels: DashMap<String, ()>,
    draining: watch::Sender<bool>,
}

#[allow(clippy::too_many_arguments)]
impl Gateway {
    pub fn new(
        auth: Arc<Authenticator>,
        limiter: Arc<RateLimiter>,
        connections: Arc<ConnectionManager>,
        router: Arc<Router>,
        engine: Arc<CollaborationEngine>,
        log: Arc<dyn EventLog>,
        kv: Arc<dyn KvStore>,
        pubsub: Arc<dyn PubSub>,
        store: Arc<dyn Store>,
        registry: Arc<ServerRegistry>,
        config: GatewayConfig,
    ) -> Self {
        let node_id = registry.node_id();
        let (draining, _) = watch::channel(false);
        Self {
            auth,
            limiter,
            connections,
            router,
            engine,
            log,
            kv,
            pubsub,
            store,
            registry,
            config,
            node_id,
            sessions: DashMap::new(),
            remote_channels: DashMap::new(),
            draining,
        }
    }

    /// Accept sockets until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_host, self.config.ws_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, node = %self.node_id, "Gateway listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_socket(stream, peer).await {
                                    debug!(peer = %peer, error = %e, "Socket ended with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Gateway draining");
                    self.drain().await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Graceful shutdown: draining node, GOING_AWAY to every socket, a
    /// grace period to drain acks, then teardown.
    pub async fn drain(&self) {
        let _ = self.draining.send(true);
        if let Err(e) = self.registry.start_draining().await {
            warn!(error = %e, "Failed to mark node draining");
        }
        let sessions: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in &sessions {
            handle.shutdown();
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
        for handle in sessions {
            self.teardown_session(&handle.session_id, "server shutdown").await;
        }
        if let Err(e) = self.registry.deregister().await {
            warn!(error = %e, "Failed to deregister node");
        }
    }

    async fn handle_socket(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut creds = HandshakeCredentials::default();
        let capture = |req: &Request, resp: Response| {
            creds_from_request(req, &mut creds);
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
        let (mut sink, mut source) = ws.split();

        let handle = match self.admit(creds).await {
            Ok(handle) => handle,
            Err(e) => {
                // One uniform close for every admission failure.
                let frame = ServerFrame::error(&e, None);
                let _ = sink.send(Message::Text(frame.to_json())).await;
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: e.code().into(),
                    })))
                    .await;
                return Err(e);
            }
        };
        let session_id = handle.session_id.clone();
        info!(session = %session_id, peer = %peer, "Socket admitted");

        // Writer: drains the bounded queue into the sink; a closed queue
        // ends it with GOING_AWAY.
        let writer = {
            let queue = handle.queue.clone();
            tokio::spawn(async move {
                while let Some(frame) = queue.pop().await {
                    if sink.send(Message::Text(frame.to_json())).await.is_err() {
                        break;
                    }
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "".into(),
                    })))
                    .await;
            })
        };

        // Heartbeat ticker: watches for missed heartbeats at the adaptive
        // interval; a FAILED session ends the socket.
        let heartbeat = {
            let gateway = Arc::clone(self);
            let session = session_id.clone();
            let mut cancel = handle.cancel.subscribe();
            tokio::spawn(async move {
                loop {
                    let interval = gateway.connections.heartbeat_interval(&session);
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if gateway.heartbeat_check(&session, interval).await {
                                // Failed session: close the socket too.
                                gateway.teardown_session(&session, "heartbeat failure").await;
                                break;
                            }
                        }
                        _ = cancel.changed() => break,
                    }
                }
            })
        };

        // Reader: the task that owns this function's future.
        let mut cancel = handle.cancel.subscribe();
        loop {
            tokio::select! {
                next = source.next() => {
                    match next {
                        Some(Ok(Message::Text(raw))) => {
                            self.handle_frame(&handle, &raw).await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            handle.send(ServerFrame::error(
                                &Error::Validation("binary frames are not supported".into()),
                                None,
                            ));
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // ws-level ping/pong
                        Some(Err(e)) => {
                            debug!(session = %session_id, error = %e, "Read error");
                            break;
                        }
                    }
                }
                _ = cancel.changed() => break,
            }
        }

        self.teardown_session(&session_id, "socket closed").await;
        heartbeat.abort();
        let _ = writer.await;
        Ok(())
    }

    /// Admission pipeline: credential, context, limits, rate budget,
    /// registration, rooms, audit.
    pub async fn admit(&self, creds: HandshakeCredentials) -> Result<Arc<SessionHandle>> {
        if *self.draining.borrow() {
            return Err(Error::Transient("node is draining".into()));
        }
        if self.sessions.len() >= self.config.max_connections {
            return Err(Error::RateLimited {
                subject: "node".into(),
                action: "connect".into(),
            });
        }

        let identity = self
            .auth
            .extract(&creds)
            .ok_or_else(|| Error::Auth("no valid credential".into()))?;
        self.auth.validate_tenant_context(&identity.ctx).await?;
        self.auth
            .check_clock_drift(&identity, Utc::now(), false)?;
        let ctx = identity.ctx;

        self.check_connection_limit(&ctx).await?;
        self.limiter.check_action(&ctx, "connect").await?;

        let session_id = SessionId::new(Uuid::new_v4().to_string());
        self.connections
            .register(&ctx, &session_id, ClientType::Web)
            .await?;
        self.router
            .join_tenant_rooms(&ctx, &session_id, self.config.join_feature_rooms);

        self.audit(&ctx, AuditAction::WebsocketConnect, "socket admitted")
            .await;

        let handle = Arc::new(SessionHandle::new(
            session_id.clone(),
            ctx,
            self.config.outbound_queue,
        ));
        self.sessions
            .insert(session_id.as_str().to_string(), handle.clone());
        self.registry.set_connection_count(self.sessions.len() as u32);
        Ok(handle)
    }

    async fn check_connection_limit(&self, ctx: &TenantContext) -> Result<()> {
        let org = self.store.get_organization(&ctx.organization_id).await?;
        let current = self.store.count_connections(&ctx.organization_id).await?;
        if current >= u64::from(org.limits.max_connections) {
            return Err(Error::Forbidden(format!(
                "organization {} is at its connection limit",
                ctx.organization_id
            )));
        }
        Ok(())
    }

    /// One heartbeat-tick staleness check. Returns true when the socket
    /// should close.
    async fn heartbeat_check(&self, session_id: &SessionId, interval: Duration) -> bool {
        let Some(conn) = self.connections.get(session_id) else {
            return true;
        };
        let age = conn.heartbeat_age_secs(Utc::now());
        if age < interval.as_secs() as i64 {
            return false;
        }
        match self.connections.record_missed_heartbeat(session_id).await {
            Ok(outcome) => {
                use crate::core::domain::ConnectionStatus;
                outcome.status == ConnectionStatus::Failed
            }
            Err(e) => {
                debug!(session = %session_id, error = %e, "Missed-heartbeat bookkeeping failed");
                true
            }
        }
    }

    /// Deliver an event to this node's subscribed sockets.
    pub(crate) async fn deliver_local(&self, event: &Event) {
        for session in self.router.subscribers_of(&event.channel) {
            let Some(handle) = self.sessions.get(session.as_str()).map(|h| h.clone()) else {
                continue;
            };
            let Some(filtered) = self
                .router
                .filter_outbound(event, handle.org(), handle.is_admin)
            else {
                continue;
            };
            let frame = ServerFrame::event(
                filtered.event_type.clone(),
                filtered.payload.clone(),
                frames::EventMetadata {
                    correlation_id: filtered.correlation_id.clone(),
                    org_id: filtered.organization_id.as_str().to_string(),
                    channel: filtered.channel.as_str().to_string(),
                    stream_entry_id: filtered.stream_entry_id.clone(),
                },
            );
            if handle.send(frame) {
                warn!(session = %session, "Suspending slow consumer");
                if let Err(e) = self.connections.suspend(&session).await {
                    debug!(session = %session, error = %e, "Suspend failed");
                }
            }
        }
    }

    /// Start the cross-node fan-out pump for a channel, once.
    pub(crate) fn ensure_remote_fanout(self: &Arc<Self>, channel: &ChannelName) {
        let key = stream_key(&channel.org_id(), channel);
        if self.remote_channels.insert(key.clone(), ()).is_some() {
            return;
        }
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match gateway.pubsub.subscribe(&key).await {
                Ok(rx) => rx,
                Err(e) => {
                    error!(channel = %key, error = %e, "Fan-out subscribe failed");
                    gateway.remote_channels.remove(&key);
                    return;
                }
            };
            while let Some(msg) = rx.recv().await {
                let Ok(notice) = serde_json::from_str::<FanoutNotice>(&msg.payload) else {
                    continue;
                };
                // Local publishes were already delivered synchronously.
                if notice.origin == gateway.node_id.as_str() {
                    continue;
                }
                gateway.deliver_local(&notice.event).await;
            }
            gateway.remote_channels.remove(&key);
        });
    }

    pub async fn teardown_session(&self, session_id: &SessionId, reason: &str) {
        let Some((_, handle)) = self.sessions.remove(session_id.as_str()) else {
            return;
        };
        handle.shutdown();
        self.router.leave_all(session_id);
        self.limiter.forget_socket(session_id);
        if let Err(e) = self.connections.disconnect(session_id).await {
            debug!(session = %session_id, error = %e, "Disconnect bookkeeping failed");
        }
        self.audit(&handle.ctx, AuditAction::WebsocketDisconnect, reason)
            .await;
        self.registry.set_connection_count(self.sessions.len() as u32);
        info!(session = %session_id, reason, "Session torn down");
    }

    pub(crate) async fn audit(&self, ctx: &TenantContext, action: AuditAction, reason: &str) {
        let subject = ctx
            .user_id
            .as_ref()
            .map(|u| u.as_str().to_string())
            .unwrap_or_else(|| "org".into());
        let record = AuditRecord::new(ctx.organization_id.clone(), subject, action, reason);
        if let Err(e) = self.store.append_audit(record).await {
            warn!(error = %e, "Audit write failed");
        }
    }
}

/// Cross-node fan-out notification payload.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct FanoutNotice {
    pub origin: String,
    pub event: Event,
}

/// Pull credentials out of the upgrade request: bearer header first, then
/// query parameters.
fn creds_from_request(req: &Request, creds: &mut HandshakeCredentials) {
    if let Some(value) = req.headers().get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                creds.bearer = Some(token.to_string());
            }
        }
    }
    if let (Some(key), Some(org)) = (
        header_string(req, "x-api-key"),
        header_string(req, "x-organization-id"),
    ) {
        creds.api_key = Some((key, org));
    }

    if let Some(query) = req.uri().query() {
        let mut demo_org = None;
        let mut demo_user = None;
        for pair in query.split('&') {
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            match k {
                "token" => creds.query_token = Some(v.to_string()),
                "organizationId" => demo_org = Some(v.to_string()),
                "userId" => demo_user = Some(v.to_string()),
                _ => {}
            }
        }
        if let Some(org) = demo_org {
            creds.demo = Some((org, demo_user));
        }
    }
}

fn header_string(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
