//! Process root: builds every component with explicit dependencies and
//! owns their lifecycles.
//!
//! Construction wires Store/KV/Log through constructors; nothing reaches
//! for a global. Shutdown flips one watch channel; the gateway drains,
//! listeners stop, background loops exit, the node deregisters.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::config::Config;
use crate::core::auth::{Authenticator, DenyAllVerifier, JwtVerifier, TokenVerifier};
use crate::core::collab::{CollabConfig, CollaborationEngine};
use crate::core::connection::ConnectionManager;
use crate::core::domain::{NodeStatus, ServerNode};
use crate::core::health::HealthMonitor;
use crate::core::kv::{KvStore, MemoryKv, PubSub, RedisKv};
use crate::core::limiter::RateLimiter;
use crate::core::log::{EventLog, MemoryLog, RedisLog};
use crate::core::registry::{compute_node_id, RegistryConfig, ServerRegistry};
use crate::core::router::Router;
use crate::core::store::Store;
use crate::error::Result;
use crate::gateway::{Gateway, GatewayConfig};
use crate::http::AppState;

/// A fully wired server, ready to run.
pub struct ServerRuntime {
    pub config: Config,
    pub gateway: Arc<Gateway>,
    pub state: Arc<AppState>,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<ServerRegistry>,
    pub health: Arc<HealthMonitor>,
    shutdown: watch::Sender<bool>,
}

impl ServerRuntime {
    /// Wire every component. The `store` is the deployment's persistence
    /// collaborator; tests and demo mode hand in a `MemoryStore`.
    pub async fn build(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let (kv, pubsub, log): (Arc<dyn KvStore>, Arc<dyn PubSub>, Arc<dyn EventLog>) =
            match &config.backend.redis_url {
                Some(url) => {
                    info!(url = %url, "Using Redis backend");
                    let kv = Arc::new(RedisKv::connect(url).await?);
                    let log = Arc::new(RedisLog::connect(url).await?);
                    (kv.clone(), kv, log)
                }
                None => {
                    info!("No REDIS_URL configured, using in-process backend");
                    let kv = Arc::new(MemoryKv::new());
                    (kv.clone(), kv, Arc::new(MemoryLog::new()))
                }
            };

        let verifier: Arc<dyn TokenVerifier> = if let Some(pem) = &config.auth.jwt_public_key {
            Arc::new(JwtVerifier::from_rsa_pem(pem.as_bytes())?)
        } else if let Some(secret) = &config.auth.jwt_secret {
            Arc::new(JwtVerifier::from_secret(secret.as_bytes()))
        } else {
            warn!("No JWT key configured, bearer tokens will be rejected");
            Arc::new(DenyAllVerifier)
        };
        let auth = Arc::new(Authenticator::new(
            verifier,
            store.clone(),
            config.auth.allow_demo,
        ));

        let limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            store.clone(),
            config.rate_limits.to_config(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            store.clone(),
            kv.clone(),
            config.connections.to_config(),
        ));
        let router = Arc::new(Router::new(store.clone()));
        let engine = Arc::new(CollaborationEngine::new(
            store.clone(),
            log.clone(),
            kv.clone(),
            CollabConfig::default(),
        ));

        let now = Utc::now();
        let node = ServerNode {
            id: compute_node_id(),
            host: config.server.host.clone(),
            port: config.server.port,
            ws_port: config.server.ws_port,
            status: NodeStatus::Active,
            capabilities: vec!["events".to_string(), "magic".to_string()],
            connections: 0,
            max_connections: config.server.max_connections as u32,
            last_heartbeat: now,
            started_at: now,
            version: env!("CARGO_PKG_VERSION").to_string(),
            region: config.server.region.clone(),
            zone: config.server.zone.clone(),
        };
        let registry = Arc::new(ServerRegistry::new(
            kv.clone(),
            RegistryConfig::default(),
            node,
        ));

        let gateway = Arc::new(Gateway::new(
            auth.clone(),
            limiter,
            connections.clone(),
            router,
            engine,
            log,
            kv.clone(),
            pubsub,
            store,
            registry.clone(),
            GatewayConfig {
                bind_host: config.server.host.clone(),
                ws_port: config.server.ws_port,
                max_connections: config.server.max_connections,
                ..GatewayConfig::default()
            },
        ));

        let health = Arc::new(HealthMonitor::new(
            connections.clone(),
            config
                .monitoring
                .to_thresholds(config.server.max_connections),
            config.monitoring.sample_interval(),
            config.monitoring.cooldown(),
        ));

        let state = Arc::new(AppState {
            auth,
            gateway: gateway.clone(),
            health: health.clone(),
            kv,
        });

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            gateway,
            state,
            connections,
            registry,
            health,
            shutdown,
        })
    }

    /// Trigger a graceful shutdown from a signal handler.
    #[must_use]
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Register the node, start every loop and both listeners, and run
    /// until shutdown.
    pub async fn run(self) -> Result<()> {
        self.registry.register().await?;

        let registry_tasks = self.registry.spawn_tasks(self.shutdown.subscribe());
        let maintenance = self.connections.spawn_maintenance(self.shutdown.subscribe());
        let health = self.health.spawn(self.shutdown.subscribe());

        let gateway = self.gateway.clone();
        let ws = tokio::spawn(gateway.run(self.shutdown.subscribe()));
        let http = tokio::spawn(crate::http::serve(
            self.state.clone(),
            self.config.server.host.clone(),
            self.config.server.port,
            self.shutdown.subscribe(),
        ));

        let (ws_result, http_result) = tokio::join!(ws, http);
        for result in [ws_result, http_result] {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Listener exited with error"),
                Err(e) => warn!(error = %e, "Listener task panicked"),
            }
        }

        registry_tasks.abort();
        maintenance.abort();
        health.abort();
        info!("Server stopped");
        Ok(())
    }
}
