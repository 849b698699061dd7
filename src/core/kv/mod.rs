//! Low-latency counters, sets, hashes and cross-node pub/sub.
//!
//! All keys carry the `axonpuls:` prefix. Pub/sub subscribers use a
//! dedicated connection distinct from the command path so a blocking
//! subscriber can never starve commands.

mod memory;
mod redis_kv;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::error::Result;

/// Namespace prefix applied to every key.
pub const KEY_PREFIX: &str = "axonpuls:";

/// Prefix a bare key with the service namespace.
#[must_use]
pub fn namespaced(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// A message received over pub/sub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Command-side key/value operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    // Counters
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64>;
    async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    // Strings
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    // Hashes
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // Sorted sets (sliding windows)
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize>;
    async fn zcard(&self, key: &str) -> Result<usize>;

    // Fan-out
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// Subscription side, served by a dedicated connection.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Subscribe to a channel; messages arrive on the returned receiver
    /// until it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>>;
}
