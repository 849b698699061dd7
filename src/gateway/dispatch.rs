//! Inbound frame dispatch.
//!
//! Each frame passes the same pipeline: socket message rate, shape
//! validation, permission, channel isolation, action rate, then the
//! handler. Every response carries the inbound frame id as its
//! correlation id.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use super::frames::{
    ClientCommand, ClientFrame, EventMetadata, GetEventsPayload, PublishPayload, ServerFrame,
    SubscribePayload, UnsubscribePayload,
};
use super::session::SessionHandle;
use super::{FanoutNotice, Gateway};
use crate::core::domain::{AuditAction, ChannelName, Event, Operation};
use crate::core::log::stream_key;
use crate::error::{Error, Result};

impl Gateway {
    /// Validate and execute one raw inbound frame, pushing every response
    /// onto the session's outbound queue.
    pub async fn handle_frame(self: &Arc<Self>, handle: &SessionHandle, raw: &str) {
        // Socket-level message budget applies before any parsing work.
        if let Err(e) = self
            .limiter
            .check_socket_message(handle.org(), &handle.session_id)
            .await
        {
            handle.send(ServerFrame::error(&e, None));
            return;
        }

        let frame = match ClientFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                handle.send(ServerFrame::error(&e, None));
                return;
            }
        };
        let correlation_id = frame.id.clone();

        if let Some(required) = frame.command.required_permission() {
            if !handle.ctx.has_permission(required) {
                let err = Error::Forbidden(format!("missing permission {required}"));
                self.audit(
                    &handle.ctx,
                    AuditAction::AccessDenied,
                    &format!("permission {required} denied for {}", frame.command.action()),
                )
                .await;
                handle.send(ServerFrame::error(&err, Some(&correlation_id)));
                return;
            }
        }

        let responses = match self.execute(handle, frame).await {
            Ok(responses) => responses,
            Err(e) => {
                if e.is_fatal() {
                    warn!(session = %handle.session_id, error = %e, "Dispatch failure");
                }
                vec![ServerFrame::error(&e, Some(&correlation_id))]
            }
        };
        for frame in responses {
            if handle.send(frame) {
                warn!(session = %handle.session_id, "Suspending slow consumer");
                if let Err(e) = self.connections.suspend(&handle.session_id).await {
                    debug!(session = %handle.session_id, error = %e, "Suspend failed");
                }
                break;
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        handle: &SessionHandle,
        frame: ClientFrame,
    ) -> Result<Vec<ServerFrame>> {
        let correlation_id = frame.id;
        match frame.command {
            ClientCommand::Ping(ping) => {
                let latency = (Utc::now().timestamp_millis() - ping.client_ts).max(0) as u64;
                self.connections
                    .record_heartbeat(&handle.session_id, latency)
                    .await?;
                Ok(vec![ServerFrame::pong(ping.client_ts)])
            }
            ClientCommand::Subscribe(payload) => {
                self.subscribe(handle, &correlation_id, payload).await
            }
            ClientCommand::Unsubscribe(payload) => {
                self.unsubscribe(handle, &correlation_id, payload)
            }
            ClientCommand::Publish(payload) => {
                self.publish(handle, &correlation_id, payload).await
            }
            ClientCommand::GetEvents(payload) => {
                self.get_events(handle, &correlation_id, payload).await
            }
            ClientCommand::RoomOperation(payload) => {
                let room_op: Operation = serde_json::from_value(payload.operation)
                    .map_err(|e| Error::Validation(format!("malformed operation: {e}")))?;
                self.limiter
                    .check_action(&handle.ctx, "room_operation")
                    .await?;
                let room = self
                    .engine
                    .get_or_create_room(&handle.ctx, &payload.room, None)
                    .await?;
                let applied = self
                    .engine
                    .apply_operation(&handle.ctx, &room.id, room_op)
                    .await?;
                Ok(vec![ServerFrame::ack(
                    &correlation_id,
                    Some(serde_json::to_value(&applied)?),
                )])
            }
        }
    }

    async fn subscribe(
        self: &Arc<Self>,
        handle: &SessionHandle,
        correlation_id: &str,
        payload: SubscribePayload,
    ) -> Result<Vec<ServerFrame>> {
        self.limiter.check_action(&handle.ctx, "subscribe").await?;
        let channels = parse_channels(&payload.channels)?;
        self.router
            .subscribe(&handle.ctx, &handle.session_id, &channels)
            .await?;

        for channel in &channels {
            self.ensure_remote_fanout(channel);
        }
        self.audit(
            &handle.ctx,
            AuditAction::ChannelSubscribe,
            &format!("subscribed {} channels", channels.len()),
        )
        .await;

        let mut responses = vec![ServerFrame::ack(
            correlation_id,
            Some(json!({ "channels": payload.channels })),
        )];

        // Replay before going live, in stream order.
        if let Some(options) = payload.options {
            if let Some(from) = options.replay_from {
                let count = options.replay_count.unwrap_or(self.config.replay_count);
                for channel in &channels {
                    let entries = self
                        .log
                        .read(&stream_key(handle.org(), channel), &from, count)
                        .await?;
                    for entry in entries {
                        if let Some(frame) = event_frame_from_entry(&entry) {
                            responses.push(frame);
                        }
                    }
                }
            }
        }
        Ok(responses)
    }

    fn unsubscribe(
        &self,
        handle: &SessionHandle,
        correlation_id: &str,
        payload: UnsubscribePayload,
    ) -> Result<Vec<ServerFrame>> {
        let channels = parse_channels(&payload.channels)?;
        self.router.unsubscribe(&handle.session_id, &channels);
        Ok(vec![ServerFrame::ack(
            correlation_id,
            Some(json!({ "channels": payload.channels })),
        )])
    }

    async fn publish(
        self: &Arc<Self>,
        handle: &SessionHandle,
        correlation_id: &str,
        payload: PublishPayload,
    ) -> Result<Vec<ServerFrame>> {
        let channel = ChannelName::parse(&payload.channel)?;
        let event = self
            .publish_event(
                &handle.ctx,
                channel,
                payload.event.event_type,
                payload.event.payload,
                Some(correlation_id.to_string()),
            )
            .await?;
        Ok(vec![ServerFrame::ack(
            correlation_id,
            Some(json!({ "stream_entry_id": event.stream_entry_id })),
        )])
    }

    /// Shared publish path for socket and HTTP publishers: isolation
    /// check, rate budget, log append, durable copy, local delivery and
    /// cross-node notify.
    pub async fn publish_event(
        self: &Arc<Self>,
        ctx: &crate::core::domain::TenantContext,
        channel: ChannelName,
        event_type: String,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Result<Event> {
        self.router.check_channel_access(ctx, &channel).await?;
        self.limiter.check_action(ctx, "publish").await?;

        let mut event = Event::new(event_type, channel.clone(), ctx.user_id.clone(), payload)?;
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation_id(correlation_id);
        }

        let key = stream_key(&ctx.organization_id, &channel);
        let fields = vec![("event".to_string(), serde_json::to_string(&event)?)];
        let entry_id = self
            .log
            .append(&key, &fields, Some(self.config.stream_trim))
            .await?;
        event.stream_entry_id = Some(entry_id);

        // Durable copy; the stream remains the source of replay.
        if let Err(e) = self.store.insert_event(&event).await {
            warn!(channel = %channel, error = %e, "Durable event write failed");
        }

        // Local sockets first, then the rest of the fleet.
        self.deliver_local(&event).await;
        let notice = FanoutNotice {
            origin: self.node_id.as_str().to_string(),
            event: event.clone(),
        };
        if let Err(e) = self
            .kv
            .publish(&key, &serde_json::to_string(&notice)?)
            .await
        {
            warn!(channel = %channel, error = %e, "Cross-node notify failed");
        }

        self.audit(
            ctx,
            AuditAction::EventPublish,
            &format!("published to {channel}"),
        )
        .await;
        Ok(event)
    }

    async fn get_events(
        &self,
        handle: &SessionHandle,
        correlation_id: &str,
        payload: GetEventsPayload,
    ) -> Result<Vec<ServerFrame>> {
        let channel = ChannelName::parse(&payload.channel)?;
        self.router
            .check_channel_access(&handle.ctx, &channel)
            .await?;
        self.limiter.check_action(&handle.ctx, "get_events").await?;

        let from = payload.from_id.unwrap_or_else(|| "0".to_string());
        let count = payload.count.unwrap_or(self.config.replay_count);
        let entries = self
            .log
            .read(&stream_key(handle.org(), &channel), &from, count)
            .await?;

        let mut responses = Vec::with_capacity(entries.len() + 1);
        responses.push(ServerFrame::ack(
            correlation_id,
            Some(json!({ "count": entries.len() })),
        ));
        for entry in entries {
            if let Some(frame) = event_frame_from_entry(&entry) {
                responses.push(frame);
            }
        }
        Ok(responses)
    }
}

fn parse_channels(raw: &[String]) -> Result<Vec<ChannelName>> {
    raw.iter().map(|c| ChannelName::parse(c)).collect()
}

/// Rehydrate a stream entry into an outbound event frame.
fn event_frame_from_entry(entry: &crate::core::log::LogEntry) -> Option<ServerFrame> {
    let body = entry.field("event")?;
    let mut event: Event = serde_json::from_str(body).ok()?;
    event.stream_entry_id = Some(entry.id.clone());
    Some(ServerFrame::event(
        event.event_type.clone(),
        event.payload.clone(),
        EventMetadata {
            correlation_id: event.correlation_id.clone(),
            org_id: event.organization_id.as_str().to_string(),
            channel: event.channel.as_str().to_string(),
            stream_entry_id: event.stream_entry_id.clone(),
        },
    ))
}
