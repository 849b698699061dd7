//! In-process log with Redis-Streams semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

use super::{entry_id_after, EventLog, LogEntry};
use crate::error::Result;

#[derive(Default)]
struct GroupState {
    /// Highest entry id handed to any consumer in this group.
    last_delivered: String,
    /// entry id -> consumer it was delivered to, until acked.
    pending: HashMap<String, String>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<LogEntry>,
    last_ms: u64,
    last_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// Next strictly-monotonic `millis-seq` id, robust to clock steps.
    fn next_id(&mut self) -> String {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.last_seq = 0;
        } else {
            self.last_seq += 1;
        }
        format!("{}-{}", self.last_ms, self.last_seq)
    }
}

/// In-memory [`EventLog`].
#[derive(Default)]
pub struct MemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    /// Wakes blocked group readers on append.
    appended: Arc<Notify>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_after(&self, key: &str, after: &str, count: usize) -> Vec<LogEntry> {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(key) else {
            return Vec::new();
        };
        stream
            .entries
            .iter()
            .filter(|e| entry_id_after(&e.id, after))
            .take(count)
            .cloned()
            .collect()
    }

    /// One non-blocking group-read pass: pending re-delivery first, then new.
    fn poll_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut streams = self.streams.lock();
        let stream = streams.entry(key.to_string()).or_default();

        // Collect this consumer's un-acked entries before borrowing mutably.
        let redelivery: Vec<String> = stream
            .groups
            .get(group)
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, c)| c.as_str() == consumer)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut out: Vec<LogEntry> = stream
            .entries
            .iter()
            .filter(|e| redelivery.contains(&e.id))
            .take(count)
            .cloned()
            .collect();

        if out.len() < count {
            let last = stream
                .groups
                .get(group)
                .map(|g| g.last_delivered.clone())
                .unwrap_or_else(|| "0".to_string());
            let fresh: Vec<LogEntry> = stream
                .entries
                .iter()
                .filter(|e| entry_id_after(&e.id, &last))
                .take(count - out.len())
                .cloned()
                .collect();

            let state = stream.groups.entry(group.to_string()).or_default();
            for entry in &fresh {
                state.pending.insert(entry.id.clone(), consumer.to_string());
                state.last_delivered = entry.id.clone();
            }
            out.extend(fresh);
        }

        out.sort_by(|a, b| {
            super::parse_entry_id(&a.id)
                .unwrap_or_default()
                .cmp(&super::parse_entry_id(&b.id).unwrap_or_default())
        });
        Ok(out)
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let id = {
            let mut streams = self.streams.lock();
            let stream = streams.entry(key.to_string()).or_default();
            let id = stream.next_id();
            stream.entries.push_back(LogEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
            if let Some(max) = max_len {
                while stream.entries.len() > max {
                    stream.entries.pop_front();
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read(&self, key: &str, after: &str, count: usize) -> Result<Vec<LogEntry>> {
        Ok(self.read_after(key, after, count))
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Duration::from_millis(block_ms);
        let mut waited = Duration::ZERO;
        loop {
            let batch = self.poll_group(key, group, consumer, count)?;
            if !batch.is_empty() || waited >= deadline {
                return Ok(batch);
            }
            // Wake on the next append, bounded by the remaining block time.
            let remaining = deadline - waited;
            let slice = remaining.min(Duration::from_millis(50));
            let _ = timeout(slice, self.appended.notified()).await;
            waited += slice;
        }
    }

    async fn ack(&self, key: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(key) {
            if let Some(state) = stream.groups.get_mut(group) {
                state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams.entry(key.to_string()).or_default();
        // Swallow "group exists", matching XGROUP CREATE + BUSYGROUP handling.
        stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: start_id.to_string(),
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<usize> {
        Ok(self
            .streams
            .lock()
            .get(key)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let log = MemoryLog::new();
        let mut last = "0".to_string();
        for i in 0..50 {
            let id = log
                .append("k", &fields(&[("n", &i.to_string())]), None)
                .await
                .unwrap();
            assert!(entry_id_after(&id, &last), "{id} !> {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn read_from_zero_returns_first_entry() {
        let log = MemoryLog::new();
        let e1 = log.append("k", &fields(&[("a", "1")]), None).await.unwrap();
        log.append("k", &fields(&[("a", "2")]), None).await.unwrap();

        let entries = log.read("k", "0", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, e1);
    }

    #[tokio::test]
    async fn read_is_exclusive_of_cursor() {
        let log = MemoryLog::new();
        let e1 = log.append("k", &fields(&[("a", "1")]), None).await.unwrap();
        let e2 = log.append("k", &fields(&[("a", "2")]), None).await.unwrap();

        let entries = log.read("k", &e1, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, e2);
    }

    #[tokio::test]
    async fn trim_is_applied_on_append() {
        let log = MemoryLog::new();
        for i in 0..20 {
            log.append("k", &fields(&[("n", &i.to_string())]), Some(5))
                .await
                .unwrap();
        }
        assert_eq!(log.len("k").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn group_read_delivers_then_redelivers_until_ack() {
        let log = MemoryLog::new();
        log.create_group("k", "g", "0").await.unwrap();
        let e1 = log.append("k", &fields(&[("a", "1")]), None).await.unwrap();

        let first = log.read_group("k", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);

        // Not acked: the same consumer sees it again after a crash/restart.
        let again = log.read_group("k", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, e1);

        log.ack("k", "g", &e1).await.unwrap();
        let empty = log.read_group("k", "g", "c1", 10, 0).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn group_consumers_compete_for_entries() {
        let log = MemoryLog::new();
        log.create_group("k", "g", "0").await.unwrap();
        log.append("k", &fields(&[("a", "1")]), None).await.unwrap();
        log.append("k", &fields(&[("a", "2")]), None).await.unwrap();

        let c1 = log.read_group("k", "g", "c1", 1, 0).await.unwrap();
        let c2 = log.read_group("k", "g", "c2", 1, 0).await.unwrap();
        assert_eq!(c1.len(), 1);
        assert_eq!(c2.len(), 1);
        assert_ne!(c1[0].id, c2[0].id);
    }

    #[tokio::test]
    async fn create_group_is_idempotent() {
        let log = MemoryLog::new();
        log.create_group("k", "g", "0").await.unwrap();
        log.append("k", &fields(&[("a", "1")]), None).await.unwrap();
        log.read_group("k", "g", "c1", 10, 0).await.unwrap();

        // Re-creating must not reset delivery state.
        log.create_group("k", "g", "0").await.unwrap();
        log.ack(
            "k",
            "g",
            &log.read_group("k", "g", "c1", 10, 0).await.unwrap()[0].id,
        )
        .await
        .unwrap();
        assert!(log.read_group("k", "g", "c1", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let log = Arc::new(MemoryLog::new());
        log.create_group("k", "g", "0").await.unwrap();

        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.read_group("k", "g", "c1", 10, 2000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("k", &fields(&[("a", "1")]), None).await.unwrap();

        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }
}
