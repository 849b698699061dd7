//! Events carried over channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::channel::ChannelName;
use super::id::{OrgId, UserId};
use crate::error::{Error, Result};

/// Maximum accepted payload size for a single event (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Delivery guarantee requested by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    #[default]
    AtLeastOnce,
    AtMostOnce,
}

/// An event as appended to the per-channel log. Immutable after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub channel: ChannelName,
    pub organization_id: OrgId,
    pub user_id: Option<UserId>,
    pub payload: serde_json::Value,
    pub ack: bool,
    pub created_at: DateTime<Utc>,
    /// Monotone id assigned by the Log on append; `None` until appended.
    pub stream_entry_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl Event {
    /// Build a new event for publication, enforcing the payload cap.
    pub fn new(
        event_type: impl Into<String>,
        channel: ChannelName,
        user_id: Option<UserId>,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let payload_len = serde_json::to_vec(&payload)?.len();
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(Error::PayloadTooLarge(payload_len));
        }

        let organization_id = channel.org_id();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            channel,
            organization_id,
            user_id,
            payload,
            ack: false,
            created_at: Utc::now(),
            stream_entry_id: None,
            correlation_id: None,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
