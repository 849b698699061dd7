//! Database sync policy for the connection hot path.
//!
//! Writing every heartbeat through the Store would melt it. The policy
//! syncs immediately only when something notable happened (degraded
//! quality, a missed heartbeat, a latency spike, a quality transition) and
//! otherwise defers to an adaptive interval. Non-urgent syncs are queued
//! into 30-second batch buckets in the KV and flushed in the background.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Duration;
use tracing::{debug, warn};

use super::quality::latency_threshold_ms;
use crate::core::domain::{Connection, ConnectionQuality};
use crate::core::kv::{namespaced, KvStore};
use crate::core::store::Store;
use crate::error::Result;

/// Batch bucket width.
pub const BATCH_BUCKET_SECS: i64 = 30;

/// How to persist a connection update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Synchronous write, caller waits (quality = CRITICAL).
    Emergency,
    /// Write now, but failure degrades to batch.
    Immediate,
    /// Queue into the current 30-second bucket.
    Batch,
    /// Nothing notable and the adaptive interval has not elapsed.
    Skip,
}

/// Minimum spacing of routine syncs per quality tier.
#[must_use]
pub fn adaptive_sync_interval(quality: ConnectionQuality) -> Duration {
    match quality {
        ConnectionQuality::Excellent => Duration::from_secs(90),
        ConnectionQuality::Good => Duration::from_secs(60),
        ConnectionQuality::Poor => Duration::from_secs(15),
        ConnectionQuality::Critical => Duration::from_secs(30),
    }
}

/// Decide how to persist `conn` after a heartbeat-path update.
#[must_use]
pub fn decide(
    conn: &Connection,
    previous_quality: ConnectionQuality,
    now: DateTime<Utc>,
) -> SyncDecision {
    if conn.quality == ConnectionQuality::Critical {
        return SyncDecision::Emergency;
    }
    if conn.missed_heartbeats > 0 {
        return SyncDecision::Immediate;
    }
    if conn.quality != previous_quality {
        return SyncDecision::Immediate;
    }
    if conn.latency_ms > 2 * latency_threshold_ms(conn.quality) {
        return SyncDecision::Immediate;
    }

    let due = match conn.last_db_sync {
        None => true,
        Some(last) => {
            let elapsed = (now - last).num_seconds().max(0) as u64;
            elapsed >= adaptive_sync_interval(conn.quality).as_secs()
        }
    };
    if due {
        SyncDecision::Batch
    } else {
        SyncDecision::Skip
    }
}

/// Queues non-urgent connection writes into KV buckets.
pub struct SyncBatcher {
    kv: Arc<dyn KvStore>,
}

impl SyncBatcher {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn bucket_key(ts: i64) -> String {
        let bucket = (ts / BATCH_BUCKET_SECS) * BATCH_BUCKET_SECS;
        namespaced(&format!("connection_sync_batch:{bucket}"))
    }

    /// Queue `conn` into the current bucket.
    pub async fn enqueue(&self, conn: &Connection) -> Result<()> {
        let key = Self::bucket_key(Utc::now().timestamp());
        let body = serde_json::to_string(conn)?;
        self.kv.hset(&key, conn.session_id.as_str(), &body).await?;
        // Buckets are self-cleaning even if a flush is missed.
        self.kv
            .expire(&key, Duration::from_secs(BATCH_BUCKET_SECS as u64 * 10))
            .await?;
        Ok(())
    }

    /// Flush buckets older than the current one into the Store.
    ///
    /// Returns the number of connections written.
    pub async fn flush_due(&self, store: &dyn Store) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut written = 0;

        // The previous two buckets cover a missed flush tick.
        for age in 1..=2 {
            let key = Self::bucket_key(now - age * BATCH_BUCKET_SECS);
            let entries = self.kv.hgetall(&key).await?;
            if entries.is_empty() {
                continue;
            }
            for (session, body) in &entries {
                match serde_json::from_str::<Connection>(body) {
                    Ok(conn) => {
                        if let Err(e) = store.upsert_connection(&conn).await {
                            warn!(session = %session, error = %e, "Batched sync failed");
                            continue;
                        }
                        written += 1;
                    }
                    Err(e) => {
                        warn!(session = %session, error = %e, "Dropping undecodable batch entry");
                    }
                }
                self.kv.hdel(&key, session).await?;
            }
            debug!(bucket = %key, written, "Flushed connection sync bucket");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::ClientType;
    use crate::core::kv::MemoryKv;
    use crate::core::store::{MemoryStore, TimeRange};

    fn conn(quality: ConnectionQuality, missed: u32, latency: u64) -> Connection {
        let mut c = Connection::new("s1", "o1", None, ClientType::Web, 5);
        c.quality = quality;
        c.missed_heartbeats = missed;
        c.latency_ms = latency;
        c
    }

    #[test]
    fn critical_forces_emergency() {
        let c = conn(ConnectionQuality::Critical, 0, 10);
        assert_eq!(
            decide(&c, ConnectionQuality::Critical, Utc::now()),
            SyncDecision::Emergency
        );
    }

    #[test]
    fn missed_heartbeats_force_immediate() {
        let c = conn(ConnectionQuality::Good, 1, 10);
        assert_eq!(
            decide(&c, ConnectionQuality::Good, Utc::now()),
            SyncDecision::Immediate
        );
    }

    #[test]
    fn quality_transition_forces_immediate() {
        let c = conn(ConnectionQuality::Good, 0, 600);
        assert_eq!(
            decide(&c, ConnectionQuality::Excellent, Utc::now()),
            SyncDecision::Immediate
        );
    }

    #[test]
    fn latency_spike_forces_immediate() {
        // EXCELLENT threshold is 500ms; a spike past 1000ms syncs now.
        let mut c = conn(ConnectionQuality::Excellent, 0, 1100);
        c.last_db_sync = Some(Utc::now());
        // Keep quality stable so only the spike rule can fire.
        c.quality = ConnectionQuality::Excellent;
        assert_eq!(
            decide(&c, ConnectionQuality::Excellent, Utc::now()),
            SyncDecision::Immediate
        );
    }

    #[test]
    fn quiet_session_batches_once_interval_elapses() {
        let now = Utc::now();
        let mut c = conn(ConnectionQuality::Excellent, 0, 100);
        c.last_db_sync = Some(now - chrono::Duration::seconds(91));
        assert_eq!(decide(&c, ConnectionQuality::Excellent, now), SyncDecision::Batch);

        c.last_db_sync = Some(now - chrono::Duration::seconds(10));
        assert_eq!(decide(&c, ConnectionQuality::Excellent, now), SyncDecision::Skip);
    }

    #[test]
    fn never_synced_session_batches() {
        let c = conn(ConnectionQuality::Excellent, 0, 100);
        assert_eq!(
            decide(&c, ConnectionQuality::Excellent, Utc::now()),
            SyncDecision::Batch
        );
    }

    #[test]
    fn poor_sessions_sync_more_often() {
        assert!(adaptive_sync_interval(ConnectionQuality::Poor)
            < adaptive_sync_interval(ConnectionQuality::Good));
        assert!(adaptive_sync_interval(ConnectionQuality::Good)
            < adaptive_sync_interval(ConnectionQuality::Excellent));
    }

    #[tokio::test]
    async fn batcher_round_trips_through_kv() {
        let kv = Arc::new(MemoryKv::new());
        let store = MemoryStore::new();
        let batcher = SyncBatcher::new(kv.clone());

        let c = conn(ConnectionQuality::Good, 0, 100);
        batcher.enqueue(&c).await.unwrap();

        // Nothing is due yet: the entry sits in the current bucket.
        assert_eq!(batcher.flush_due(&store).await.unwrap(), 0);

        // Re-file the entry into an already-elapsed bucket to simulate
        // the 30s boundary passing.
        let current = SyncBatcher::bucket_key(Utc::now().timestamp());
        let old = SyncBatcher::bucket_key(Utc::now().timestamp() - BATCH_BUCKET_SECS);
        let body = kv.hget(&current, "s1").await.unwrap().unwrap();
        kv.hdel(&current, "s1").await.unwrap();
        kv.hset(&old, "s1", &body).await.unwrap();

        assert_eq!(batcher.flush_due(&store).await.unwrap(), 1);
        let listed = store
            .list_connections(&"o1".into(), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        // Flushed entries are removed from the bucket.
        assert_eq!(batcher.flush_due(&store).await.unwrap(), 0);
    }
}
