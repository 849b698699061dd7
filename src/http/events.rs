//! Event replay, HTTP publish fallback and the health probe.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{authenticate, with_idempotency, ApiError, ApiResult, AppState};
use crate::core::domain::{ChannelName, Event};
use crate::core::log::stream_key;
use crate::error::Error;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReplayQuery {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
}

pub(crate) async fn replay(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ReplayQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    if !ctx.has_permission("Event:read") {
        return Err(ApiError(Error::Forbidden(
            "missing permission Event:read".into(),
        )));
    }
    let channel = ChannelName::parse(&name).map_err(ApiError)?;
    state
        .gateway
        .router
        .check_channel_access(&ctx, &channel)
        .await?;

    let from = query.from.unwrap_or_else(|| "0".to_string());
    let count = query.count.unwrap_or(state.gateway.config.replay_count);
    let entries = state
        .gateway
        .log
        .read(&stream_key(&ctx.organization_id, &channel), &from, count)
        .await?;

    let events: Vec<serde_json::Value> = entries
        .iter()
        .filter_map(|entry| {
            let mut event: Event = serde_json::from_str(entry.field("event")?).ok()?;
            event.stream_entry_id = Some(entry.id.clone());
            serde_json::to_value(&event).ok()
        })
        .collect();
    Ok(Json(json!({
        "channel": name,
        "count": events.len(),
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishBody {
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// HTTP publish fallback for clients without a socket.
pub(crate) async fn publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PublishBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    if !ctx.has_permission("Event:create") {
        return Err(ApiError(Error::Forbidden(
            "missing permission Event:create".into(),
        )));
    }
    with_idempotency(&state, &ctx, &headers, || async {
        let channel = ChannelName::parse(&body.channel)?;
        let event = state
            .gateway
            .publish_event(
                &ctx,
                channel,
                body.event_type.clone(),
                body.payload.clone(),
                body.correlation_id.clone(),
            )
            .await?;
        Ok(json!({
            "id": event.id,
            "stream_entry_id": event.stream_entry_id,
        }))
    })
    .await
}

/// Health summary from the monitor. Unauthenticated so load balancers
/// can probe it.
pub(crate) async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let snapshot = state.health.sample();
    Json(json!({
        "status": if snapshot.alerts.is_empty() { "ok" } else { "degraded" },
        "snapshot": snapshot,
    }))
}
