//! Collaboration room handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{authenticate, with_idempotency, ApiError, ApiResult, AppState};
use crate::core::domain::{MergeStrategy, Operation, RevertStrategy, RoomConfig};
use crate::error::Error;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateRoomBody {
    pub name: String,
    #[serde(default)]
    pub config: Option<RoomConfig>,
}

pub(crate) async fn create_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    with_idempotency(&state, &ctx, &headers, || async {
        let room = state
            .gateway
            .engine
            .get_or_create_room(&ctx, &body.name, body.config.clone())
            .await?;
        Ok(serde_json::to_value(&room).map_err(Error::from)?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct PresenceBody {
    #[serde(default)]
    pub participant: Option<String>,
}

fn participant_of(ctx: &crate::core::domain::TenantContext, body: &PresenceBody) -> String {
    body.participant
        .clone()
        .or_else(|| ctx.user_id.as_ref().map(|u| u.as_str().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

pub(crate) async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PresenceBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    let engine = &state.gateway.engine;
    let room = engine.get_or_create_room(&ctx, &room, None).await?;
    let participant = participant_of(&ctx, &body);
    let participants = engine.join_room(&ctx, &room.id, &participant).await?;
    Ok(Json(json!({
        "room": room.name,
        "participants": participants,
    })))
}

pub(crate) async fn leave_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PresenceBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    let engine = &state.gateway.engine;
    let room = engine.get_or_create_room(&ctx, &room, None).await?;
    let participant = participant_of(&ctx, &body);
    engine.leave_room(&ctx, &room.id, &participant).await?;
    Ok(Json(json!({
        "room": room.name,
        "participants": engine.participants(&room.id),
    })))
}

pub(crate) async fn room_state(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    let engine = &state.gateway.engine;
    let room = engine.get_or_create_room(&ctx, &room, None).await?;
    let room = engine.room_state(&ctx, &room.id).await?;
    Ok(Json(serde_json::to_value(&room).map_err(Error::from)?))
}

pub(crate) async fn apply_operation(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(operation): Json<Operation>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    if !ctx.has_permission("Room:write") {
        return Err(ApiError(Error::Forbidden(
            "missing permission Room:write".into(),
        )));
    }
    with_idempotency(&state, &ctx, &headers, || async {
        let engine = &state.gateway.engine;
        let room = engine.get_or_create_room(&ctx, &room, None).await?;
        let applied = engine.apply_operation(&ctx, &room.id, operation).await?;
        Ok(serde_json::to_value(&applied).map_err(Error::from)?)
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SnapshotBody {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub(crate) async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    with_idempotency(&state, &ctx, &headers, || async {
        let engine = &state.gateway.engine;
        let room = engine.get_or_create_room(&ctx, &room, None).await?;
        let snapshot = engine
            .create_snapshot(&ctx, &room.id, body.branch.as_deref(), body.description.clone())
            .await?;
        Ok(serde_json::to_value(&snapshot).map_err(Error::from)?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevertQuery {
    #[serde(default = "default_revert_strategy")]
    pub strategy: RevertStrategy,
}

fn default_revert_strategy() -> RevertStrategy {
    RevertStrategy::Safe
}

pub(crate) async fn revert_to_snapshot(
    State(state): State<Arc<AppState>>,
    Path((room, snapshot_id)): Path<(String, String)>,
    Query(query): Query<RevertQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    with_idempotency(&state, &ctx, &headers, || async {
        let engine = &state.gateway.engine;
        let room = engine.get_or_create_room(&ctx, &room, None).await?;
        let reverted = engine
            .revert_to_snapshot(&ctx, &room.id, &snapshot_id, query.strategy)
            .await?;
        Ok(serde_json::to_value(&reverted).map_err(Error::from)?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateBranchBody {
    pub name: String,
    pub from_snapshot_id: String,
}

pub(crate) async fn create_branch(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateBranchBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    with_idempotency(&state, &ctx, &headers, || async {
        let engine = &state.gateway.engine;
        let room = engine.get_or_create_room(&ctx, &room, None).await?;
        let branch = engine
            .create_branch(&ctx, &room.id, &body.from_snapshot_id, &body.name)
            .await?;
        Ok(serde_json::to_value(&branch).map_err(Error::from)?)
    })
    .await
}

pub(crate) async fn list_branches(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    let engine = &state.gateway.engine;
    let room = engine.get_or_create_room(&ctx, &room, None).await?;
    let branches = engine.list_branches(&ctx, &room.id).await?;
    Ok(Json(serde_json::to_value(&branches).map_err(Error::from)?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct MergeBody {
    pub source: String,
    pub target: String,
    pub strategy: MergeStrategy,
}

pub(crate) async fn merge_branches(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MergeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    with_idempotency(&state, &ctx, &headers, || async {
        let engine = &state.gateway.engine;
        let room = engine.get_or_create_room(&ctx, &room, None).await?;
        let outcome = engine
            .merge_branches(&ctx, &room.id, &body.source, &body.target, body.strategy)
            .await?;
        Ok(serde_json::to_value(&outcome).map_err(Error::from)?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompareQuery {
    pub left: String,
    pub right: String,
}

pub(crate) async fn compare_branches(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(query): Query<CompareQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    let engine = &state.gateway.engine;
    let room = engine.get_or_create_room(&ctx, &room, None).await?;
    let comparison = engine
        .compare_branches(&ctx, &room.id, &query.left, &query.right)
        .await?;
    Ok(Json(
        serde_json::to_value(&comparison).map_err(Error::from)?,
    ))
}

pub(crate) async fn timeline(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = authenticate(&state, &headers).await?;
    let engine = &state.gateway.engine;
    let room = engine.get_or_create_room(&ctx, &room, None).await?;
    let timeline = engine.timeline(&ctx, &room.id).await?;
    Ok(Json(serde_json::to_value(&timeline).map_err(Error::from)?))
}
