//! Audit records for security-relevant outcomes.
//!
//! Every Auth/Forbidden/RateLimited failure, plus socket connect and
//! disconnect, produces one of these through the Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::OrgId;

/// Audited action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    WebsocketConnect,
    WebsocketDisconnect,
    AuthFailed,
    AccessDenied,
    RateLimitExceeded,
    ChannelSubscribe,
    EventPublish,
}

/// One audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub organization_id: OrgId,
    pub subject: String,
    pub action: AuditAction,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        organization_id: impl Into<OrgId>,
        subject: impl Into<String>,
        action: AuditAction,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            subject: subject.into(),
            action,
            reason: reason.into(),
            ts: Utc::now(),
        }
    }
}
