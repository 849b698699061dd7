//! In-process KV and pub/sub for tests and single-node demo mode.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

use super::{KvStore, PubSub, PubSubMessage};
use crate::error::Result;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// DashMap-backed [`KvStore`] + [`PubSub`].
///
/// TTLs are enforced lazily on read, which is indistinguishable from real
/// expiry to callers of this interface.
#[derive(Default)]
pub struct MemoryKv {
    strings: DashMap<String, Entry>,
    hashes: DashMap<String, HashMap<String, String>>,
    sets: DashMap<String, std::collections::HashSet<String>>,
    zsets: DashMap<String, HashMap<String, f64>>,
    topics: DashMap<String, broadcast::Sender<PubSubMessage>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, channel: &str) -> broadcast::Sender<PubSubMessage> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64> {
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        if !entry.live() {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let next = entry.value.parse::<i64>().unwrap_or(0) + by;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let slot = hash.entry(field.to_string()).or_insert_with(|| "0".into());
        let next = slot.parse::<i64>().unwrap_or(0) + by;
        *slot = next.to_string();
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .strings
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .get_mut(key)
            .map(|mut s| s.remove(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let Some(mut zset) = self.zsets.get_mut(key) else {
            return Ok(0);
        };
        let doomed: Vec<String> = zset
            .iter()
            .filter(|(_, s)| **s >= min && **s <= max)
            .map(|(m, _)| m.clone())
            .collect();
        for member in &doomed {
            zset.remove(member);
        }
        Ok(doomed.len())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.zsets.get(key).map(|z| z.len()).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No subscribers is not an error, matching Redis PUBLISH.
        let _ = self.topic(channel).send(PubSubMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryKv {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let mut source = self.topic(channel).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_counts_up() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("c").await.unwrap(), 1);
        assert_eq!(kv.incr("c").await.unwrap(), 2);
        assert_eq!(kv.incr_by("c", 5).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_counter_restarts_from_zero() {
        let kv = MemoryKv::new();
        kv.incr("c").await.unwrap();
        kv.expire("c", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.incr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sets_track_membership() {
        let kv = MemoryKv::new();
        assert!(kv.sadd("s", "a").await.unwrap());
        assert!(!kv.sadd("s", "a").await.unwrap());
        assert!(kv.srem("s", "a").await.unwrap());
        assert!(kv.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zset_range_removal() {
        let kv = MemoryKv::new();
        kv.zadd("w", "m1", 10.0).await.unwrap();
        kv.zadd("w", "m2", 20.0).await.unwrap();
        kv.zadd("w", "m3", 30.0).await.unwrap();
        let removed = kv.zremrangebyscore("w", 0.0, 20.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.zcard("w").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("events").await.unwrap();
        kv.publish("events", "hello").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "events");
        assert_eq!(msg.payload, "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let kv = MemoryKv::new();
        kv.publish("nobody", "hi").await.unwrap();
    }
}
