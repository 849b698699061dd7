//! Wire protocol frames.
//!
//! Every frame is `{ id, type, payload, timestamp }` with a closed set of
//! payload shapes per type; frames are validated at the edge and typed
//! values flow inward. Unknown types or malformed payloads fail parsing
//! and surface as `VALIDATION_ERROR` frames.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::DeliveryGuarantee;
use crate::error::{Error, Result};

/// Hard cap on a single inbound frame (1 MiB payload plus envelope slack).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024 + 4096;

/// Inbound frame envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub id: String,
    #[serde(flatten)]
    pub command: ClientCommand,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl ClientFrame {
    /// Parse and validate one raw text frame.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(Error::PayloadTooLarge(raw.len()));
        }
        serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("malformed frame: {e}")))
    }
}

/// Typed inbound commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    Publish(PublishPayload),
    Ping(PingPayload),
    GetEvents(GetEventsPayload),
    RoomOperation(RoomOperationPayload),
}

impl ClientCommand {
    /// Permission required to execute this command, if any.
    #[must_use]
    pub fn required_permission(&self) -> Option<&'static str> {
        match self {
            ClientCommand::Subscribe(_) => Some("Channel:read"),
            ClientCommand::Unsubscribe(_) => None,
            ClientCommand::Publish(_) => Some("Event:create"),
            ClientCommand::Ping(_) => None,
            ClientCommand::GetEvents(_) => Some("Event:read"),
            ClientCommand::RoomOperation(_) => Some("Room:write"),
        }
    }

    /// Action name for rate limiting and audit.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            ClientCommand::Subscribe(_) => "subscribe",
            ClientCommand::Unsubscribe(_) => "unsubscribe",
            ClientCommand::Publish(_) => "publish",
            ClientCommand::Ping(_) => "ping",
            ClientCommand::GetEvents(_) => "get_events",
            ClientCommand::RoomOperation(_) => "room_operation",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribePayload {
    pub channels: Vec<String>,
    #[serde(default)]
    pub options: Option<SubscribeOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeOptions {
    /// Replay entries with ids after this one before going live.
    pub replay_from: Option<String>,
    pub replay_count: Option<usize>,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribePayload {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishPayload {
    pub channel: String,
    pub event: PublishEvent,
    #[serde(default)]
    pub options: Option<PublishOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub delivery_guarantee: DeliveryGuarantee,
    pub partition_key: Option<String>,
    #[serde(default)]
    pub acknowledgment: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingPayload {
    /// Client send time, epoch milliseconds; latency = now - client_ts.
    pub client_ts: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetEventsPayload {
    pub channel: String,
    #[serde(default)]
    pub from_id: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomOperationPayload {
    pub room: String,
    pub operation: serde_json::Value,
}

/// Outbound frame envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    pub id: String,
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: i64,
}

impl ServerFrame {
    fn wrap(message: ServerMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn event(
        event_type: String,
        payload: serde_json::Value,
        metadata: EventMetadata,
    ) -> Self {
        Self::wrap(ServerMessage::Event(EventPayload {
            event_type,
            payload,
            metadata,
        }))
    }

    pub fn ack(correlation_id: &str, details: Option<serde_json::Value>) -> Self {
        Self::wrap(ServerMessage::Ack(AckPayload {
            correlation_id: correlation_id.to_string(),
            status: "ok".to_string(),
            details,
        }))
    }

    pub fn pong(client_ts: i64) -> Self {
        Self::wrap(ServerMessage::Pong(PongPayload {
            client_ts,
            server_ts: Utc::now().timestamp_millis(),
        }))
    }

    /// Error frame; carries a code and message, never a stack trace.
    pub fn error(err: &Error, correlation_id: Option<&str>) -> Self {
        let message = match err {
            // Internal failures stay opaque on the wire.
            Error::WebSocket(_) | Error::Json(_) | Error::Io(_) | Error::Fatal(_)
            | Error::Config(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        Self::wrap(ServerMessage::Error(ErrorPayload {
            error: ErrorBody {
                code: err.code().to_string(),
                message,
            },
            correlation_id: correlation_id.map(str::to_string),
        }))
    }

    /// True for frames that must never be dropped under backpressure.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(
            self.message,
            ServerMessage::Ack(_) | ServerMessage::Error(_) | ServerMessage::Pong(_)
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Typed outbound messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Event(EventPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Pong(PongPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMetadata {
    pub correlation_id: Option<String>,
    pub org_id: String,
    pub channel: String,
    pub stream_entry_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    pub correlation_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PongPayload {
    pub client_ts: i64,
    pub server_ts: i64,
}
