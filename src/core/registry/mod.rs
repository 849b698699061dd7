//! Distributed server registry: node heartbeats, dead-node reaping and
//! load-aware placement.
//!
//! Every node writes its record into a shared KV hash and refreshes it on
//! a heartbeat cadence. Any node may reap a peer whose record has gone
//! stale, publishing a `server_died` notification so routers can shed the
//! dead node immediately.

use std::process;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::core::domain::{NodeId, NodeStatus, OrgId, ServerNode};
use crate::core::kv::{namespaced, KvStore};
use crate::error::{Error, Result};

/// Shared hash of node id -> serialized [`ServerNode`].
pub fn registry_key() -> String {
    namespaced("servers:registry")
}

/// Set of node ids currently registered.
pub fn active_key() -> String {
    namespaced("servers:active")
}

/// Pub/sub channel for cluster membership events.
pub fn events_channel() -> String {
    namespaced("server:events")
}

/// Registry timing.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    /// Records older than this are reaped.
    pub node_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            node_ttl: Duration::from_secs(90),
        }
    }
}

/// Compute a unique node id: `hostname-pid-<rand>`.
#[must_use]
pub fn compute_node_id() -> NodeId {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let noise: u32 = rand::thread_rng().gen_range(0x1000..0xffff);
    NodeId::new(format!("{host}-{}-{noise:x}", process::id()))
}

/// This node's view of the cluster registry.
pub struct ServerRegistry {
    kv: Arc<dyn KvStore>,
    config: RegistryConfig,
    node: parking_lot::RwLock<ServerNode>,
}

impl ServerRegistry {
    pub fn new(kv: Arc<dyn KvStore>, config: RegistryConfig, node: ServerNode) -> Self {
        Self {
            kv,
            config,
            node: parking_lot::RwLock::new(node),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.read().id.clone()
    }

    /// Write this node's record and mark it active.
    pub async fn register(&self) -> Result<()> {
        let node = {
            let mut n = self.node.write();
            n.last_heartbeat = Utc::now();
            n.clone()
        };
        self.write_record(&node).await?;
        self.kv.sadd(&active_key(), node.id.as_str()).await?;
        info!(node = %node.id, host = %node.host, "Node registered");
        Ok(())
    }

    /// Refresh this node's heartbeat and load figures.
    pub async fn heartbeat(&self) -> Result<()> {
        let node = {
            let mut n = self.node.write();
            n.last_heartbeat = Utc::now();
            n.clone()
        };
        self.write_record(&node).await
    }

    /// Report the current accepted-connection count.
    pub fn set_connection_count(&self, connections: u32) {
        self.node.write().connections = connections;
    }

    /// Move this node to draining: no new connections are placed here.
    pub async fn start_draining(&self) -> Result<()> {
        let node = {
            let mut n = self.node.write();
            n.status = NodeStatus::Draining;
            n.clone()
        };
        info!(node = %node.id, "Node draining");
        self.write_record(&node).await
    }

    /// Remove this node from the registry on shutdown.
    pub async fn deregister(&self) -> Result<()> {
        let id = self.node_id();
        self.kv.hdel(&registry_key(), id.as_str()).await?;
        self.kv.srem(&active_key(), id.as_str()).await?;
        self.kv
            .publish(
                &events_channel(),
                &json!({"type": "server_stopped", "id": id.as_str()}).to_string(),
            )
            .await?;
        info!(node = %id, "Node deregistered");
        Ok(())
    }

    /// All records currently in the shared hash.
    pub async fn list_nodes(&self) -> Result<Vec<ServerNode>> {
        let raw = self.kv.hgetall(&registry_key()).await?;
        let mut nodes = Vec::with_capacity(raw.len());
        for (id, body) in raw {
            match serde_json::from_str::<ServerNode>(&body) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(node = %id, error = %e, "Undecodable registry record"),
            }
        }
        Ok(nodes)
    }

    /// Remove records older than the TTL; publish `server_died` for each.
    pub async fn reap_dead(&self) -> Result<Vec<NodeId>> {
        let now = Utc::now();
        let ttl_secs = self.config.node_ttl.as_secs() as i64;
        let mut reaped = Vec::new();

        for node in self.list_nodes().await? {
            let age = (now - node.last_heartbeat).num_seconds();
            if age <= ttl_secs {
                continue;
            }
            self.kv.hdel(&registry_key(), node.id.as_str()).await?;
            self.kv.srem(&active_key(), node.id.as_str()).await?;
            self.kv
                .publish(
                    &events_channel(),
                    &json!({"type": "server_died", "id": node.id.as_str()}).to_string(),
                )
                .await?;
            warn!(node = %node.id, age_secs = age, "Reaped dead node");
            reaped.push(node.id);
        }
        Ok(reaped)
    }

    /// Least-loaded active node with headroom; falls back to the least
    /// loaded active node when every node is above the headroom cutoff.
    pub async fn get_best_node(&self, _org: Option<&OrgId>) -> Result<ServerNode> {
        let nodes = self.list_nodes().await?;
        let active: Vec<&ServerNode> = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect();

        let compare = |a: &&ServerNode, b: &&ServerNode| {
            a.load_factor()
                .partial_cmp(&b.load_factor())
                .unwrap_or(std::cmp::Ordering::Equal)
        };

        if let Some(best) = active
            .iter()
            .filter(|n| n.accepts_connections())
            .min_by(|a, b| compare(a, b))
        {
            return Ok((*best).clone());
        }
        active
            .into_iter()
            .min_by(|a, b| compare(&a, &b))
            .cloned()
            .ok_or_else(|| Error::NotFound("no active nodes".into()))
    }

    /// Heartbeat + reaper loops until shutdown.
    pub fn spawn_tasks(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(registry.config.heartbeat_interval);
            let mut reaper = tokio::time::interval(registry.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if let Err(e) = registry.heartbeat().await {
                            warn!(error = %e, "Registry heartbeat failed");
                        }
                    }
                    _ = reaper.tick() => {
                        if let Err(e) = registry.reap_dead().await {
                            warn!(error = %e, "Registry reaper failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Registry tasks stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn write_record(&self, node: &ServerNode) -> Result<()> {
        let body = serde_json::to_string(node)?;
        self.kv
            .hset(&registry_key(), node.id.as_str(), &body)
            .await
    }
}
