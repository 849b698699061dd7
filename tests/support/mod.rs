//! Shared harness for integration tests: a fully wired runtime over the
//! in-memory backend, with a seeded organization and member user.

use std::sync::Arc;

use axonpuls::app::config::{AuthConfig, Config};
use axonpuls::app::runtime::ServerRuntime;
use axonpuls::core::auth::HandshakeCredentials;
use axonpuls::core::domain::{OrgId, Organization, UserId};
use axonpuls::core::store::{MemoryStore, Store};
use axonpuls::gateway::frames::ServerFrame;
use axonpuls::gateway::session::SessionHandle;
use axonpuls::gateway::Gateway;

pub struct TestServer {
    pub runtime: ServerRuntime,
    pub store: Arc<MemoryStore>,
}

/// Build a runtime in demo-credential mode with org `o1` and user `u1`
/// seeded.
pub async fn server() -> TestServer {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_organization(Organization::new("o1", "acme"))
        .await
        .unwrap();
    store
        .register_user(&OrgId::new("o1"), &UserId::new("u1"))
        .await
        .unwrap();

    let config = Config {
        auth: AuthConfig {
            allow_demo: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let runtime = ServerRuntime::build(config, store.clone())
        .await
        .expect("runtime builds over memory backend");
    TestServer { runtime, store }
}

/// Admit a demo-mode socket for `user` in org `o1`.
pub async fn admit(gateway: &Arc<Gateway>, user: &str) -> Arc<SessionHandle> {
    let creds = HandshakeCredentials {
        demo: Some(("o1".to_string(), Some(user.to_string()))),
        ..Default::default()
    };
    gateway.admit(creds).await.expect("admission succeeds")
}

/// Drain every frame currently queued for a session.
pub async fn drain(handle: &SessionHandle) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while !handle.queue.is_empty() {
        if let Some(frame) = handle.queue.pop().await {
            frames.push(parse_frame(&frame));
        }
    }
    frames
}

pub fn parse_frame(frame: &ServerFrame) -> serde_json::Value {
    serde_json::from_str(&frame.to_json()).unwrap()
}

/// Frames of a given wire type from a drained batch.
pub fn of_type<'a>(
    frames: &'a [serde_json::Value],
    wire_type: &str,
) -> Vec<&'a serde_json::Value> {
    frames
        .iter()
        .filter(|f| f["type"] == wire_type)
        .collect()
}
