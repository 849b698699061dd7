//! Session lifecycle management: heartbeats, quality, reconnection and
//! cleanup.
//!
//! # Architecture
//!
//! The manager owns the in-process session map. The gateway's per-socket
//! heartbeat task reports heartbeats and misses here; everything else
//! (status transitions, adaptive pacing, database sync policy) is decided
//! in this module. A background maintenance task drives stale cleanup,
//! batch sync flushing and the 60-second metrics snapshot.

pub mod quality;
pub mod reconnect;
pub mod sync;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::core::domain::{
    ClientType, Connection, ConnectionQuality, ConnectionStatus, SessionId, TenantContext,
};
use crate::core::kv::KvStore;
use crate::core::retry::{with_retry, BackoffPolicy};
use crate::core::store::Store;
use crate::error::{Error, Result};

pub use quality::{adaptive_interval, classify, should_restart_timer};
pub use reconnect::{AdaptiveFactors, ReconnectPolicy, ReconnectStrategy};
pub use sync::{SyncBatcher, SyncDecision};

/// Connection manager tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server-side heartbeat interval before adaptation.
    pub heartbeat_interval: Duration,
    /// Misses tolerated before the session goes RECONNECTING.
    pub max_missed_heartbeats: u32,
    /// Sessions silent this long are reaped by cleanup.
    pub stale_after: Duration,
    /// Cleanup task cadence.
    pub cleanup_interval: Duration,
    /// Metrics snapshot cadence.
    pub metrics_interval: Duration,
    /// Batch sync flush cadence.
    pub batch_flush_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            stale_after: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            metrics_interval: Duration::from_secs(60),
            batch_flush_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Result of a successful heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatOutcome {
    pub quality: ConnectionQuality,
    /// Adapted heartbeat interval for this session.
    pub interval: Duration,
    /// True when the caller should restart its heartbeat timer.
    pub restart_timer: bool,
}

/// Result of a missed heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct MissedOutcome {
    pub status: ConnectionStatus,
    /// Delay before the scheduled reconnection attempt, when one exists.
    pub reconnect_delay: Option<Duration>,
}

/// Aggregate counters for the health monitor.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub total_sessions: usize,
    pub connected: usize,
    pub reconnecting: usize,
    pub suspended: usize,
    pub avg_latency_ms: f64,
    pub quality_counts: HashMap<ConnectionQuality, usize>,
    pub total_disconnections: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
}

impl ConnectionStats {
    /// Success-rate based uptime over the observed sync attempts.
    #[must_use]
    pub fn sync_success_rate(&self) -> f64 {
        if self.sync_attempts == 0 {
            return 1.0;
        }
        1.0 - self.sync_failures as f64 / self.sync_attempts as f64
    }
}

#[derive(Default)]
struct Counters {
    disconnections: AtomicU64,
    sync_attempts: AtomicU64,
    sync_failures: AtomicU64,
}

/// Owns every session accepted by this node.
pub struct ConnectionManager {
    store: Arc<dyn Store>,
    config: ConnectionConfig,
    sessions: DashMap<String, Connection>,
    /// Current adapted heartbeat interval per session.
    intervals: DashMap<String, Duration>,
    batcher: SyncBatcher,
    adaptive: parking_lot::RwLock<AdaptiveFactors>,
    counters: Counters,
}

impl ConnectionManager {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn KvStore>, config: ConnectionConfig) -> Self {
        Self {
            store,
            config,
            sessions: DashMap::new(),
            intervals: DashMap::new(),
            batcher: SyncBatcher::new(kv),
            adaptive: parking_lot::RwLock::new(AdaptiveFactors::default()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Health monitor feedback for the ADAPTIVE reconnect strategy.
    pub fn set_adaptive_factors(&self, factors: AdaptiveFactors) {
        *self.adaptive.write() = factors;
    }

    /// Register a freshly admitted session.
    pub async fn register(
        &self,
        ctx: &TenantContext,
        session_id: &SessionId,
        client_type: ClientType,
    ) -> Result<Connection> {
        let conn = Connection::new(
            session_id.clone(),
            ctx.organization_id.clone(),
            ctx.user_id.clone(),
            client_type,
            self.config.reconnect.max_attempts,
        );
        self.persist_now(&conn).await?;
        self.sessions
            .insert(session_id.as_str().to_string(), conn.clone());
        self.intervals.insert(
            session_id.as_str().to_string(),
            self.config.heartbeat_interval,
        );
        info!(
            session = %session_id,
            org = %ctx.organization_id,
            "Session registered"
        );
        Ok(conn)
    }

    /// Snapshot of a live session.
    pub fn get(&self, session_id: &SessionId) -> Option<Connection> {
        self.sessions.get(session_id.as_str()).map(|c| c.clone())
    }

    /// Current adapted heartbeat interval for a session.
    pub fn heartbeat_interval(&self, session_id: &SessionId) -> Duration {
        self.intervals
            .get(session_id.as_str())
            .map(|i| *i)
            .unwrap_or(self.config.heartbeat_interval)
    }

    /// Record a heartbeat with its measured round-trip latency.
    pub async fn record_heartbeat(
        &self,
        session_id: &SessionId,
        latency_ms: u64,
    ) -> Result<HeartbeatOutcome> {
        let (snapshot, previous_quality) = {
            let mut entry = self
                .sessions
                .get_mut(session_id.as_str())
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            let conn = entry.value_mut();

            if conn.status == ConnectionStatus::Failed {
                return Err(Error::Conflict(format!("session {session_id} has failed")));
            }

            let previous_quality = conn.quality;
            let now = Utc::now();

            // A heartbeat while RECONNECTING means the client came back.
            if conn.status == ConnectionStatus::Reconnecting {
                conn.status = ConnectionStatus::Connected;
                conn.connected_at = now;
            }

            conn.last_heartbeat = now;
            conn.latency_ms = latency_ms;
            conn.missed_heartbeats = 0;
            conn.quality = quality::classify(0, latency_ms);

            // Attempt counter resets after a stable connected stretch.
            if conn.reconnect_attempts > 0 {
                let stable = (now - conn.connected_at).num_seconds().max(0) as u64;
                if stable >= self.config.reconnect.reset_after.as_secs() {
                    debug!(session = %session_id, "Reconnect attempts reset after stable period");
                    conn.reconnect_attempts = 0;
                    conn.next_reconnect_at = None;
                }
            }

            (conn.clone(), previous_quality)
        };

        self.apply_sync(&snapshot, previous_quality).await?;

        let current = self
            .intervals
            .get(session_id.as_str())
            .map(|i| *i)
            .unwrap_or(self.config.heartbeat_interval);
        let next = quality::adaptive_interval(self.config.heartbeat_interval, snapshot.quality);
        let restart = quality::should_restart_timer(current, next);
        if restart {
            self.intervals
                .insert(session_id.as_str().to_string(), next);
        }

        Ok(HeartbeatOutcome {
            quality: snapshot.quality,
            interval: if restart { next } else { current },
            restart_timer: restart,
        })
    }

    /// Record a missed heartbeat; transitions to RECONNECTING after the
    /// configured tolerance and to FAILED once attempts are exhausted.
    pub async fn record_missed_heartbeat(&self, session_id: &SessionId) -> Result<MissedOutcome> {
        let (snapshot, previous_quality, delay) = {
            let mut entry = self
                .sessions
                .get_mut(session_id.as_str())
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            let conn = entry.value_mut();

            if conn.status == ConnectionStatus::Failed {
                return Ok(MissedOutcome {
                    status: ConnectionStatus::Failed,
                    reconnect_delay: None,
                });
            }

            let previous_quality = conn.quality;
            conn.missed_heartbeats += 1;
            conn.quality = quality::classify(conn.missed_heartbeats, conn.latency_ms);

            let mut delay = None;
            if conn.missed_heartbeats >= self.config.max_missed_heartbeats {
                if conn.reconnect_attempts >= self.config.reconnect.max_attempts {
                    // Attempts exhausted: terminal, no further retries.
                    conn.status = ConnectionStatus::Failed;
                    conn.next_reconnect_at = None;
                    warn!(
                        session = %session_id,
                        attempts = conn.reconnect_attempts,
                        "Reconnect attempts exhausted, session failed"
                    );
                } else {
                    conn.status = ConnectionStatus::Reconnecting;
                    conn.reconnect_attempts += 1;
                    let factors = *self.adaptive.read();
                    let d = self
                        .config
                        .reconnect
                        .delay_for(conn.reconnect_attempts, factors);
                    conn.next_reconnect_at =
                        Some(Utc::now() + ChronoDuration::milliseconds(d.as_millis() as i64));
                    delay = Some(d);
                    debug!(
                        session = %session_id,
                        attempt = conn.reconnect_attempts,
                        delay_ms = d.as_millis() as u64,
                        "Reconnection scheduled"
                    );
                }
            }

            (conn.clone(), previous_quality, delay)
        };

        self.apply_sync(&snapshot, previous_quality).await?;
        Ok(MissedOutcome {
            status: snapshot.status,
            reconnect_delay: delay,
        })
    }

    /// Policy suspension (rate limit, admin action).
    pub async fn suspend(&self, session_id: &SessionId) -> Result<()> {
        self.transition(session_id, ConnectionStatus::Suspended)
            .await
    }

    /// Explicit resume from suspension.
    pub async fn resume(&self, session_id: &SessionId) -> Result<()> {
        let snapshot = {
            let mut entry = self
                .sessions
                .get_mut(session_id.as_str())
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            let conn = entry.value_mut();
            if conn.status != ConnectionStatus::Suspended {
                return Err(Error::Conflict(format!(
                    "session {session_id} is not suspended"
                )));
            }
            conn.status = ConnectionStatus::Connected;
            conn.connected_at = Utc::now();
            conn.clone()
        };
        self.persist_now(&snapshot).await
    }

    /// Close a session and drop its in-process state.
    pub async fn disconnect(&self, session_id: &SessionId) -> Result<()> {
        let snapshot = {
            let mut entry = self
                .sessions
                .get_mut(session_id.as_str())
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            let conn = entry.value_mut();
            conn.status = ConnectionStatus::Disconnected;
            conn.disconnected_at = Some(Utc::now());
            conn.total_disconnections += 1;
            conn.clone()
        };
        self.counters.disconnections.fetch_add(1, Ordering::Relaxed);
        self.persist_now(&snapshot).await?;
        self.sessions.remove(session_id.as_str());
        self.intervals.remove(session_id.as_str());
        info!(session = %session_id, "Session disconnected");
        Ok(())
    }

    /// Mark sessions DISCONNECTED once their heartbeat is older than the
    /// stale threshold, removing their in-process state.
    pub async fn cleanup_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                e.value().heartbeat_age_secs(now) > self.config.stale_after.as_secs() as i64
            })
            .map(|e| e.key().clone())
            .collect();

        for key in &stale {
            let session = SessionId::new(key.as_str());
            if let Err(e) = self.disconnect(&session).await {
                warn!(session = %session, error = %e, "Stale cleanup failed");
            }
        }
        if !stale.is_empty() {
            info!(reaped = stale.len(), "Stale sessions cleaned up");
        }
        Ok(stale.len())
    }

    /// Aggregate counters for observability.
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            total_sessions: self.sessions.len(),
            total_disconnections: self.counters.disconnections.load(Ordering::Relaxed),
            sync_attempts: self.counters.sync_attempts.load(Ordering::Relaxed),
            sync_failures: self.counters.sync_failures.load(Ordering::Relaxed),
            ..Default::default()
        };
        let mut latency_sum = 0u64;
        for entry in self.sessions.iter() {
            let conn = entry.value();
            match conn.status {
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Reconnecting => stats.reconnecting += 1,
                ConnectionStatus::Suspended => stats.suspended += 1,
                _ => {}
            }
            latency_sum += conn.latency_ms;
            *stats.quality_counts.entry(conn.quality).or_insert(0) += 1;
        }
        if stats.total_sessions > 0 {
            stats.avg_latency_ms = latency_sum as f64 / stats.total_sessions as f64;
        }
        stats
    }

    /// Maintenance loop: stale cleanup, batch flush, metrics snapshot.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut cleanup = tokio::time::interval(manager.config.cleanup_interval);
            let mut flush = tokio::time::interval(manager.config.batch_flush_interval);
            let mut metrics = tokio::time::interval(manager.config.metrics_interval);
            loop {
                tokio::select! {
                    _ = cleanup.tick() => {
                        if let Err(e) = manager.cleanup_stale().await {
                            warn!(error = %e, "Cleanup pass failed");
                        }
                    }
                    _ = flush.tick() => {
                        if let Err(e) = manager.batcher.flush_due(manager.store.as_ref()).await {
                            warn!(error = %e, "Batch sync flush failed");
                        }
                    }
                    _ = metrics.tick() => {
                        let stats = manager.stats();
                        info!(
                            sessions = stats.total_sessions,
                            connected = stats.connected,
                            reconnecting = stats.reconnecting,
                            avg_latency_ms = stats.avg_latency_ms,
                            sync_success_rate = stats.sync_success_rate(),
                            "Connection metrics"
                        );
                    }
                    _ = shutdown.changed() => {
                        debug!("Connection maintenance stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn transition(&self, session_id: &SessionId, status: ConnectionStatus) -> Result<()> {
        let snapshot = {
            let mut entry = self
                .sessions
                .get_mut(session_id.as_str())
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            entry.value_mut().status = status;
            entry.value().clone()
        };
        self.persist_now(&snapshot).await
    }

    /// Persist with retry; used for registration and explicit transitions.
    async fn persist_now(&self, conn: &Connection) -> Result<()> {
        self.counters.sync_attempts.fetch_add(1, Ordering::Relaxed);
        let mut stamped = conn.clone();
        stamped.last_db_sync = Some(Utc::now());
        let result = with_retry("connection_sync", BackoffPolicy::default(), || {
            let c = stamped.clone();
            let store = Arc::clone(&self.store);
            async move { store.upsert_connection(&c).await }
        })
        .await;
        match result {
            Ok(()) => {
                if let Some(mut entry) = self.sessions.get_mut(conn.session_id.as_str()) {
                    entry.value_mut().last_db_sync = stamped.last_db_sync;
                }
                Ok(())
            }
            Err(e) => {
                self.counters.sync_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Apply the heartbeat-path sync decision for an updated session.
    async fn apply_sync(
        &self,
        conn: &Connection,
        previous_quality: ConnectionQuality,
    ) -> Result<()> {
        match sync::decide(conn, previous_quality, Utc::now()) {
            SyncDecision::Emergency => self.persist_now(conn).await,
            SyncDecision::Immediate => {
                // Immediate writes degrade to the batch path on failure.
                if let Err(e) = self.persist_now(conn).await {
                    warn!(
                        session = %conn.session_id,
                        error = %e,
                        "Immediate sync failed, degrading to batch"
                    );
                    self.enqueue_batch(conn).await;
                }
                Ok(())
            }
            SyncDecision::Batch => {
                self.enqueue_batch(conn).await;
                Ok(())
            }
            SyncDecision::Skip => Ok(()),
        }
    }

    async fn enqueue_batch(&self, conn: &Connection) {
        let mut stamped = conn.clone();
        stamped.last_db_sync = Some(Utc::now());
        if let Err(e) = self.batcher.enqueue(&stamped).await {
            warn!(session = %conn.session_id, error = %e, "Batch enqueue failed");
            return;
        }
        if let Some(mut entry) = self.sessions.get_mut(conn.session_id.as_str()) {
            entry.value_mut().last_db_sync = stamped.last_db_sync;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::MemoryKv;
    use crate::core::store::MemoryStore;

    fn manager() -> ConnectionManager {
        manager_with(ConnectionConfig::default())
    }

    fn manager_with(config: ConnectionConfig) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryKv::new()),
            config,
        )
    }

    fn ctx() -> TenantContext {
        TenantContext::for_org("o1").with_user("u1")
    }

    async fn registered(m: &ConnectionManager) -> SessionId {
        let session = SessionId::new("s1");
        m.register(&ctx(), &session, ClientType::Web).await.unwrap();
        session
    }

    #[tokio::test]
    async fn register_then_get() {
        let m = manager();
        let session = registered(&m).await;
        let conn = m.get(&session).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert!(conn.last_db_sync.is_some());
    }

    #[tokio::test]
    async fn heartbeat_updates_quality_and_resets_misses() {
        let m = manager();
        let session = registered(&m).await;

        m.record_missed_heartbeat(&session).await.unwrap();
        let outcome = m.record_heartbeat(&session, 640).await.unwrap();
        assert_eq!(outcome.quality, ConnectionQuality::Good);

        let conn = m.get(&session).unwrap();
        assert_eq!(conn.missed_heartbeats, 0);
        assert_eq!(conn.latency_ms, 640);
    }

    #[tokio::test]
    async fn quality_sequence_matches_latency_ladder() {
        let m = manager();
        let session = registered(&m).await;
        let mut seen = Vec::new();
        for latency in [120, 180, 640, 1200, 1200, 1200] {
            let outcome = m.record_heartbeat(&session, latency).await.unwrap();
            seen.push(outcome.quality);
        }
        use ConnectionQuality::*;
        assert_eq!(seen, vec![Excellent, Excellent, Good, Poor, Poor, Poor]);
    }

    #[tokio::test]
    async fn three_misses_go_critical_and_reconnecting() {
        let m = manager();
        let session = registered(&m).await;

        m.record_missed_heartbeat(&session).await.unwrap();
        m.record_missed_heartbeat(&session).await.unwrap();
        let outcome = m.record_missed_heartbeat(&session).await.unwrap();

        assert_eq!(outcome.status, ConnectionStatus::Reconnecting);
        assert!(outcome.reconnect_delay.is_some());
        let conn = m.get(&session).unwrap();
        assert_eq!(conn.quality, ConnectionQuality::Critical);
        assert_eq!(conn.reconnect_attempts, 1);
        assert!(conn.next_reconnect_at.is_some());
    }

    #[tokio::test]
    async fn backoff_sequence_then_failed() {
        let m = manager();
        let session = registered(&m).await;

        // Reach the miss threshold once; subsequent misses each schedule
        // another attempt.
        m.record_missed_heartbeat(&session).await.unwrap();
        m.record_missed_heartbeat(&session).await.unwrap();

        let mut delays = Vec::new();
        for _ in 0..5 {
            let outcome = m.record_missed_heartbeat(&session).await.unwrap();
            assert_eq!(outcome.status, ConnectionStatus::Reconnecting);
            delays.push(outcome.reconnect_delay.unwrap().as_millis() as u64);
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);

        // Sixth trigger: attempts exhausted, terminal FAILED.
        let outcome = m.record_missed_heartbeat(&session).await.unwrap();
        assert_eq!(outcome.status, ConnectionStatus::Failed);
        assert!(outcome.reconnect_delay.is_none());
        let conn = m.get(&session).unwrap();
        assert_eq!(conn.reconnect_attempts, 5);

        // FAILED stays failed.
        let again = m.record_missed_heartbeat(&session).await.unwrap();
        assert_eq!(again.status, ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn heartbeat_recovers_reconnecting_session() {
        let m = manager();
        let session = registered(&m).await;
        for _ in 0..3 {
            m.record_missed_heartbeat(&session).await.unwrap();
        }
        assert_eq!(
            m.get(&session).unwrap().status,
            ConnectionStatus::Reconnecting
        );

        m.record_heartbeat(&session, 100).await.unwrap();
        assert_eq!(m.get(&session).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn suspend_requires_explicit_resume() {
        let m = manager();
        let session = registered(&m).await;

        m.suspend(&session).await.unwrap();
        assert_eq!(m.get(&session).unwrap().status, ConnectionStatus::Suspended);

        // Heartbeats do not resume a suspended session.
        m.record_heartbeat(&session, 50).await.unwrap();
        assert_eq!(m.get(&session).unwrap().status, ConnectionStatus::Suspended);

        m.resume(&session).await.unwrap();
        assert_eq!(m.get(&session).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn resume_rejects_non_suspended() {
        let m = manager();
        let session = registered(&m).await;
        assert!(m.resume(&session).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_drops_in_process_state() {
        let m = manager();
        let session = registered(&m).await;
        m.disconnect(&session).await.unwrap();
        assert!(m.get(&session).is_none());
        assert!(m.record_heartbeat(&session, 10).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_reaps_stale_sessions() {
        let m = manager_with(ConnectionConfig {
            stale_after: Duration::from_secs(0),
            ..Default::default()
        });
        let session = registered(&m).await;

        // Age the heartbeat past the (zero) stale threshold.
        if let Some(mut entry) = m.sessions.get_mut(session.as_str()) {
            entry.value_mut().last_heartbeat = Utc::now() - ChronoDuration::seconds(10);
        }
        let reaped = m.cleanup_stale().await.unwrap();
        assert_eq!(reaped, 1);
        assert!(m.get(&session).is_none());
    }

    #[tokio::test]
    async fn adaptive_interval_restarts_only_past_hysteresis() {
        let m = manager();
        let session = registered(&m).await;

        // EXCELLENT: 30s base -> 45s, a 15s move, restart expected.
        let outcome = m.record_heartbeat(&session, 50).await.unwrap();
        assert!(outcome.restart_timer);
        assert_eq!(outcome.interval, Duration::from_secs(45));

        // Still EXCELLENT: interval unchanged, no restart.
        let outcome = m.record_heartbeat(&session, 60).await.unwrap();
        assert!(!outcome.restart_timer);
        assert_eq!(outcome.interval, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn stats_aggregate_sessions() {
        let m = manager();
        let s1 = SessionId::new("s1");
        let s2 = SessionId::new("s2");
        m.register(&ctx(), &s1, ClientType::Web).await.unwrap();
        m.register(&ctx(), &s2, ClientType::Web).await.unwrap();
        m.record_heartbeat(&s1, 100).await.unwrap();
        m.record_heartbeat(&s2, 300).await.unwrap();

        let stats = m.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.connected, 2);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(
            stats.quality_counts.get(&ConnectionQuality::Excellent),
            Some(&2)
        );
        assert!(stats.sync_success_rate() > 0.99);
    }
}
