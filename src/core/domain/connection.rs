//! Socket session record and its lifecycle enums.
//!
//! A [`Connection`] is owned exclusively by the node that accepted it; other
//! nodes reference it by id only. The `ConnectionManager` is the only writer
//! after admission.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{OrgId, SessionId, UserId};

/// Session lifecycle state.
///
/// ```text
/// CONNECTED --miss N hb--> RECONNECTING --ok--> CONNECTED
///     |                        | max retries
///     v                        v
/// DISCONNECTED --stale--> (reaped)     FAILED
/// ```
///
/// `Suspended` is entered on policy (rate limit, admin action) and exited
/// only by explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Suspended,
    Failed,
}

impl ConnectionStatus {
    /// Terminal states accept no further transitions except reaping.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Failed)
    }
}

/// Deterministic classification of a session's network condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

/// Client platform reported at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Web,
    Mobile,
    Server,
    Sdk,
}

/// A socket session as tracked by the ConnectionManager and persisted
/// through the Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub session_id: SessionId,
    pub organization_id: OrgId,
    pub user_id: Option<UserId>,
    pub client_type: ClientType,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub next_reconnect_at: Option<DateTime<Utc>>,
    pub quality: ConnectionQuality,
    pub latency_ms: u64,
    pub missed_heartbeats: u32,
    pub total_disconnections: u32,
    pub metadata: HashMap<String, serde_json::Value>,
    pub last_db_sync: Option<DateTime<Utc>>,
}

impl Connection {
    /// Fresh session in the initial CONNECTED state.
    pub fn new(
        session_id: impl Into<SessionId>,
        organization_id: impl Into<OrgId>,
        user_id: Option<UserId>,
        client_type: ClientType,
        max_reconnect_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            organization_id: organization_id.into(),
            user_id,
            client_type,
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_heartbeat: now,
            disconnected_at: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            next_reconnect_at: None,
            quality: ConnectionQuality::Excellent,
            latency_ms: 0,
            missed_heartbeats: 0,
            total_disconnections: 0,
            metadata: HashMap::new(),
            last_db_sync: None,
        }
    }

    /// Seconds since the last heartbeat was observed.
    #[must_use]
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }
}
