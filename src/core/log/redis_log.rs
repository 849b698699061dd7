//! Redis-Streams implementation of the event log.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::time::{timeout, Duration};

use super::{EventLog, LogEntry};
use crate::error::{Error, Result};

/// Default per-command deadline for Redis round-trips.
pub const REDIS_DEADLINE: Duration = Duration::from_secs(1);

/// [`EventLog`] backed by Redis streams (XADD/XRANGE/XREADGROUP/XACK).
#[derive(Clone)]
pub struct RedisLog {
    conn: ConnectionManager,
    deadline: Duration,
}

impl RedisLog {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("bad redis url: {e}")))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            deadline: REDIS_DEADLINE,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn bounded<T>(
        &self,
        budget: Duration,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match timeout(budget, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::Transient("redis deadline exceeded".into())),
        }
    }

    fn entries_from_range(reply: StreamRangeReply) -> Vec<LogEntry> {
        reply
            .ids
            .into_iter()
            .map(|entry| LogEntry {
                fields: decode_fields(&entry.map),
                id: entry.id,
            })
            .collect()
    }

    fn entries_from_read(reply: StreamReadReply) -> Vec<LogEntry> {
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| LogEntry {
                fields: decode_fields(&entry.map),
                id: entry.id,
            })
            .collect()
    }

    async fn read_group_with_cursor(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        cursor: &str,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if block_ms > 0 {
            options = options.block(block_ms as usize);
        }
        let budget = self.deadline + Duration::from_millis(block_ms);
        let reply: StreamReadReply = self
            .bounded(budget, conn.xread_options(&[key], &[cursor], &options))
            .await?;
        Ok(Self::entries_from_read(reply))
    }
}

fn decode_fields(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect()
}

#[async_trait]
impl EventLog for RedisLog {
    async fn append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = match max_len {
            Some(max) => {
                self.bounded(
                    self.deadline,
                    conn.xadd_maxlen(key, StreamMaxlen::Approx(max), "*", fields),
                )
                .await?
            }
            None => {
                self.bounded(self.deadline, conn.xadd(key, "*", fields))
                    .await?
            }
        };
        Ok(id)
    }

    async fn read(&self, key: &str, after: &str, count: usize) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        // Exclusive lower bound; "(0" excludes only the impossible 0-0.
        let start = format!("({after}");
        let reply: StreamRangeReply = self
            .bounded(self.deadline, conn.xrange_count(key, start, "+", count))
            .await?;
        Ok(Self::entries_from_range(reply))
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        // Pending (delivered but un-acked) first, so a restarted consumer
        // resumes from its last acknowledged id.
        let pending = self
            .read_group_with_cursor(key, group, consumer, count, 0, "0")
            .await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read_group_with_cursor(key, group, consumer, count, block_ms, ">")
            .await
    }

    async fn ack(&self, key: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded(self.deadline, conn.xack(key, group, &[entry_id]))
            .await?;
        Ok(())
    }

    async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = timeout(
            self.deadline,
            conn.xgroup_create_mkstream(key, group, start_id),
        )
        .await
        .map_err(|_| Error::Transient("redis deadline exceeded".into()))?;

        match created {
            Ok(()) => Ok(()),
            // Idempotent create: an existing group is fine.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = self.bounded(self.deadline, conn.xlen(key)).await?;
        Ok(len)
    }
}
