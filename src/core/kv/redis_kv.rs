//! Redis implementation of the KV and pub/sub interfaces.
//!
//! Commands go through a shared `ConnectionManager`. Each subscription
//! opens its own pub/sub connection from the client, so blocked
//! subscribers never occupy the command pool.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::{KvStore, PubSub, PubSubMessage};
use crate::error::{Error, Result};

/// Default per-command deadline.
const DEADLINE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    conn: ConnectionManager,
    deadline: Duration,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("bad redis url: {e}")))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            deadline: DEADLINE,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match timeout(self.deadline, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::Transient("redis deadline exceeded".into())),
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.bounded(conn.incr(key, by)).await
    }

    async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.bounded(conn.hincr(key, field, by)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                self.bounded(conn.set_ex(key, value, ttl.as_secs().max(1)))
                    .await
            }
            None => self.bounded(conn.set(key, value)).await,
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: bool = self
            .bounded(conn.expire(key, ttl.as_secs().max(1) as i64))
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(conn.del(key)).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: bool = self.bounded(conn.hset(key, field, value)).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(conn.hget(key, field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.bounded(conn.hgetall(key)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(conn.hdel(key, field)).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self.bounded(conn.sadd(key, member)).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.bounded(conn.srem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded(conn.smembers(key)).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.bounded(conn.zrembyscore(key, min, max)).await
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.bounded(conn.zcard(key)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(conn.publish(channel, message)).await?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisKv {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        // Dedicated connection per subscription.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Undecodable pub/sub payload");
                        continue;
                    }
                };
                let delivered = tx
                    .send(PubSubMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    })
                    .await;
                if delivered.is_err() {
                    debug!(channel = %channel, "Subscriber dropped, ending pump");
                    break;
                }
            }
        });
        Ok(rx)
    }
}
