//! Cluster node records for the server registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::NodeId;

/// Node lifecycle state in the shared registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Draining,
    Inactive,
}

/// One server process in the fleet.
///
/// Created at boot, refreshed on every registry heartbeat, reaped by any
/// node once `now - last_heartbeat` exceeds the node TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNode {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub ws_port: u16,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    pub connections: u32,
    pub max_connections: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub version: String,
    pub region: Option<String>,
    pub zone: Option<String>,
}

impl ServerNode {
    /// Load as a fraction of capacity, in [0, 1] for healthy configs.
    #[must_use]
    pub fn load_factor(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        f64::from(self.connections) / f64::from(self.max_connections)
    }

    /// Placement eligibility: active and under 90% of capacity.
    #[must_use]
    pub fn accepts_connections(&self) -> bool {
        self.status == NodeStatus::Active && self.load_factor() < 0.9
    }
}
