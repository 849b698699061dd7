//! HTTP surface: collaboration endpoints, event replay, publish fallback
//! and the health probe.
//!
//! Mutating collaboration POSTs honor an `Idempotency-Key` header: the
//! first response is cached in the KV for a day and replayed verbatim for
//! retries of the same key.

mod events;
mod magic;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::core::auth::{Authenticator, HandshakeCredentials};
use crate::core::domain::TenantContext;
use crate::core::health::HealthMonitor;
use crate::core::kv::KvStore;
use crate::error::{Error, Result};
use crate::gateway::Gateway;

/// Shared handler state.
pub struct AppState {
    pub auth: Arc<Authenticator>,
    pub gateway: Arc<Gateway>,
    pub health: Arc<HealthMonitor>,
    pub kv: Arc<dyn KvStore>,
}

/// Build the full route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/magic/rooms", post(magic::create_room))
        .route("/magic/:room/join", post(magic::join_room))
        .route("/magic/:room/leave", post(magic::leave_room))
        .route("/magic/rooms/:room/state", get(magic::room_state))
        .route("/magic/rooms/:room/operation", post(magic::apply_operation))
        .route("/magic/rooms/:room/snapshots", post(magic::create_snapshot))
        .route(
            "/magic/rooms/:room/revert/:snapshot_id",
            post(magic::revert_to_snapshot),
        )
        .route(
            "/magic/rooms/:room/branches",
            post(magic::create_branch).get(magic::list_branches),
        )
        .route("/magic/rooms/:room/merge", post(magic::merge_branches))
        .route("/magic/rooms/:room/compare", get(magic::compare_branches))
        .route("/magic/rooms/:room/timeline", get(magic::timeline))
        .route("/channels/:name/replay", get(events::replay))
        .route("/events", post(events::publish))
        .route("/healthz", get(events::healthz))
        .with_state(state)
}

/// Serve until shutdown flips.
pub async fn serve(
    state: Arc<AppState>,
    host: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| Error::Fatal(format!("http server: {e}")))
}

/// Authenticate a request from its bearer header.
pub(crate) async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<TenantContext> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let creds = HandshakeCredentials {
        bearer,
        ..Default::default()
    };
    let identity = state
        .auth
        .extract(&creds)
        .ok_or_else(|| Error::Auth("no valid credential".into()))?;
    state.auth.validate_tenant_context(&identity.ctx).await?;
    Ok(identity.ctx)
}

/// Error-to-response mapping; bodies mirror the socket error frames.
pub(crate) struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::SubscriptionLimit(_) => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = Json(serde_json::json!({
            "error": { "code": self.0.code(), "message": message }
        }));
        (status, body).into_response()
    }
}

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

/// Replay a cached idempotent response, or run `work` and cache it.
pub(crate) async fn with_idempotency<F, Fut>(
    state: &AppState,
    ctx: &TenantContext,
    headers: &HeaderMap,
    work: F,
) -> ApiResult<Json<serde_json::Value>>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ApiResult<serde_json::Value>>,
{
    let key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|k| {
            crate::core::kv::namespaced(&format!("idem:{}:{k}", ctx.organization_id))
        });

    if let Some(key) = &key {
        if let Some(cached) = state.kv.get(key).await.map_err(ApiError)? {
            if let Ok(value) = serde_json::from_str(&cached) {
                return Ok(Json(value));
            }
        }
    }

    let value = work().await?;
    if let Some(key) = &key {
        let body = value.to_string();
        let _ = state
            .kv
            .set(key, &body, Some(tokio::time::Duration::from_secs(86_400)))
            .await;
    }
    Ok(Json(value))
}
