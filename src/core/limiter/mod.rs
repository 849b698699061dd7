//! Per-tenant rate limiting.
//!
//! Two families of limits:
//!
//! - **Socket message rate**: a socket-local sliding window (default
//!   100 messages / 60 s) with a shared KV sanity counter that catches a
//!   client hammering the same identity across nodes.
//! - **Action rate**: per-org per-action fixed windows enforced through
//!   KV `INCR` + TTL, shaped by an in-process token bucket whose burst
//!   capacity is twice the steady rate.
//!
//! Denials surface as `Error::RateLimited` and emit an audit record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::core::domain::{AuditAction, AuditRecord, OrgId, SessionId, TenantContext};
use crate::core::kv::{namespaced, KvStore};
use crate::core::store::Store;
use crate::error::{Error, Result};

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Messages allowed per socket per window.
    pub socket_messages: u32,
    /// Socket window length.
    pub socket_window: Duration,
    /// Steady per-org rates by action name; `default_action_limit` covers
    /// the rest.
    pub action_limits: HashMap<String, u32>,
    pub default_action_limit: u32,
    /// Action window length.
    pub action_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            socket_messages: 100,
            socket_window: Duration::from_secs(60),
            action_limits: HashMap::new(),
            default_action_limit: 120,
            action_window: Duration::from_secs(60),
        }
    }
}

/// Token bucket with capacity 2x the steady rate.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(steady_rate: u32, window: Duration) -> Self {
        let capacity = f64::from(steady_rate) * 2.0;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: f64::from(steady_rate) / window.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Socket-local sliding window of message timestamps.
#[derive(Debug, Default)]
struct SocketWindow {
    hits: VecDeque<Instant>,
}

impl SocketWindow {
    fn admit(&mut self, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        while self
            .hits
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            self.hits.pop_front();
        }
        if self.hits.len() >= limit as usize {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

/// Sliding-window and burst limits per (org, subject, action).
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn Store>,
    config: RateLimitConfig,
    sockets: DashMap<String, SocketWindow>,
    buckets: DashMap<String, parking_lot::Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<dyn Store>, config: RateLimitConfig) -> Self {
        Self {
            kv,
            store,
            config,
            sockets: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    fn window_start(&self) -> i64 {
        let secs = self.config.action_window.as_secs() as i64;
        (Utc::now().timestamp() / secs) * secs
    }

    fn steady_rate(&self, action: &str) -> u32 {
        self.config
            .action_limits
            .get(action)
            .copied()
            .unwrap_or(self.config.default_action_limit)
    }

    async fn audit_denial(&self, org: &OrgId, subject: &str, action: &str) {
        let record = AuditRecord::new(
            org.clone(),
            subject,
            AuditAction::RateLimitExceeded,
            format!("rate limit exceeded for action {action}"),
        );
        if let Err(e) = self.store.append_audit(record).await {
            warn!(error = %e, "Failed to write rate limit audit record");
        }
    }

    /// Admit one inbound socket message for `session`.
    pub async fn check_socket_message(&self, org: &OrgId, session: &SessionId) -> Result<()> {
        let admitted = self
            .sockets
            .entry(session.as_str().to_string())
            .or_default()
            .admit(self.config.socket_messages, self.config.socket_window);

        if !admitted {
            self.audit_denial(org, session.as_str(), "socket_message").await;
            return Err(Error::RateLimited {
                subject: session.as_str().to_string(),
                action: "socket_message".to_string(),
            });
        }

        // Shared sanity counter: catches the same identity spread across
        // nodes. KV trouble degrades to local-only enforcement.
        let key = namespaced(&format!(
            "rl:{org}:{session}:socket_message:{}",
            self.window_start()
        ));
        match self.kv.incr(&key).await {
            Ok(total) => {
                let _ = self.kv.expire(&key, self.config.socket_window * 2).await;
                if total > i64::from(self.config.socket_messages) * 2 {
                    self.audit_denial(org, session.as_str(), "socket_message").await;
                    return Err(Error::RateLimited {
                        subject: session.as_str().to_string(),
                        action: "socket_message".to_string(),
                    });
                }
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "KV sanity check skipped");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Admit one `action` for the tenant, counting against the org window
    /// and the burst bucket.
    pub async fn check_action(&self, ctx: &TenantContext, action: &str) -> Result<()> {
        let subject = ctx
            .user_id
            .as_ref()
            .map(|u| u.as_str().to_string())
            .unwrap_or_else(|| "org".to_string());
        let org = &ctx.organization_id;
        let steady = self.steady_rate(action);

        // Burst shaping happens in-process first; it is strictly tighter
        // than the window during spikes.
        let bucket_key = format!("{org}:{subject}:{action}");
        let burst_ok = self
            .buckets
            .entry(bucket_key)
            .or_insert_with(|| {
                parking_lot::Mutex::new(TokenBucket::new(steady, self.config.action_window))
            })
            .lock()
            .try_take();
        if !burst_ok {
            self.audit_denial(org, &subject, action).await;
            return Err(Error::RateLimited {
                subject,
                action: action.to_string(),
            });
        }

        let key = namespaced(&format!(
            "rl:{org}:{subject}:{action}:{}",
            self.window_start()
        ));
        match self.kv.incr(&key).await {
            Ok(count) => {
                let _ = self.kv.expire(&key, self.config.action_window * 2).await;
                if count > i64::from(steady) {
                    self.audit_denial(org, &subject, action).await;
                    return Err(Error::RateLimited {
                        subject,
                        action: action.to_string(),
                    });
                }
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "KV window check skipped");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Drop the in-process window for a closed socket.
    pub fn forget_socket(&self, session: &SessionId) {
        self.sockets.remove(session.as_str());
    }
}
