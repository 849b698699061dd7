//! Aggregate health sampling, EMA smoothing and alerting.
//!
//! The monitor samples the ConnectionManager on a fixed cadence, smooths
//! the series with exponential moving averages, classifies node load from
//! connection-derived proxies and raises typed alerts with tiered
//! severities. Alerts de-duplicate by type; re-notification waits out a
//! cooldown unless severity escalates.
//!
//! Uptime here is success-rate based: the fraction of attempted connection
//! syncs that succeeded, not process wall-clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::core::connection::{AdaptiveFactors, ConnectionManager, ConnectionStats};
use crate::core::domain::ConnectionQuality;

/// Severity multipliers for metrics that alarm when too high.
pub const OVER_TIERS: [f64; 3] = [1.2, 1.5, 2.0];
/// Severity multipliers for metrics that alarm when too low.
pub const UNDER_TIERS: [f64; 3] = [0.9, 0.8, 0.6];

/// Exponential moving average with fixed smoothing.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Fold in one sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    HighLatency,
    HighErrorRate,
    LowConnectionQuality,
    SystemOverload,
}

/// The single canonical severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

/// One raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// Tier a metric that alarms above its threshold.
#[must_use]
pub fn severity_over(value: f64, threshold: f64) -> Option<AlertSeverity> {
    if threshold <= 0.0 {
        return None;
    }
    let ratio = value / threshold;
    if ratio >= OVER_TIERS[2] {
        Some(AlertSeverity::Critical)
    } else if ratio >= OVER_TIERS[1] {
        Some(AlertSeverity::High)
    } else if ratio >= OVER_TIERS[0] {
        Some(AlertSeverity::Medium)
    } else {
        None
    }
}

/// Tier a metric that alarms below its threshold.
#[must_use]
pub fn severity_under(value: f64, threshold: f64) -> Option<AlertSeverity> {
    if threshold <= 0.0 {
        return None;
    }
    let ratio = value / threshold;
    if ratio <= UNDER_TIERS[2] {
        Some(AlertSeverity::Critical)
    } else if ratio <= UNDER_TIERS[1] {
        Some(AlertSeverity::High)
    } else if ratio <= UNDER_TIERS[0] {
        Some(AlertSeverity::Medium)
    } else {
        None
    }
}

/// Alert thresholds; env overrides land here via the config layer.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Smoothed latency above this is HIGH_LATENCY (ms).
    pub latency_ms: f64,
    /// Smoothed sync error rate above this is HIGH_ERROR_RATE.
    pub error_rate: f64,
    /// Fraction of sessions at EXCELLENT/GOOD below this is
    /// LOW_CONNECTION_QUALITY.
    pub quality_ratio: f64,
    /// Blended load above this is SYSTEM_OVERLOAD.
    pub load: f64,
    /// Capacity used for the load proxy.
    pub capacity_hint: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            latency_ms: 500.0,
            error_rate: 0.05,
            quality_ratio: 0.7,
            load: 0.8,
            capacity_hint: 10_000,
        }
    }
}

/// De-duplicating alert sink with cooldown and escalation.
pub struct AlertCenter {
    cooldown: Duration,
    active: HashMap<AlertType, AlertSeverity>,
    last_notified: HashMap<AlertType, Instant>,
}

impl AlertCenter {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            active: HashMap::new(),
            last_notified: HashMap::new(),
        }
    }

    /// Feed one evaluation; returns the alert when it should be notified.
    ///
    /// Escalation notifies immediately; an unchanged or lowered severity
    /// honors the cooldown; `None` severity clears the alert.
    pub fn observe(&mut self, alert: Option<Alert>) -> Option<Alert> {
        let Some(alert) = alert else {
            return None;
        };
        let now = Instant::now();
        let escalated = self
            .active
            .get(&alert.alert_type)
            .map(|prev| alert.severity > *prev)
            .unwrap_or(true);
        self.active.insert(alert.alert_type, alert.severity);

        if escalated {
            self.last_notified.insert(alert.alert_type, now);
            return Some(alert);
        }
        let due = self
            .last_notified
            .get(&alert.alert_type)
            .map(|t| now.duration_since(*t) >= self.cooldown)
            .unwrap_or(true);
        if due {
            self.last_notified.insert(alert.alert_type, now);
            Some(alert)
        } else {
            None
        }
    }

    /// Clear a recovered alert type so the next raise notifies again.
    pub fn clear(&mut self, alert_type: AlertType) {
        self.active.remove(&alert_type);
        self.last_notified.remove(&alert_type);
    }
}

/// Smoothed metrics for one sampling pass.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub sessions: usize,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub reconnect_ratio: f64,
    pub quality_ratio: f64,
    pub load: f64,
    /// Success-rate based uptime.
    pub uptime: f64,
    pub alerts: Vec<Alert>,
}

struct Smoothers {
    latency: Ema,
    error_rate: Ema,
    reconnect: Ema,
}

/// Samples connection stats and raises alerts.
pub struct HealthMonitor {
    connections: Arc<ConnectionManager>,
    thresholds: HealthThresholds,
    sample_interval: Duration,
    smoothers: Mutex<Smoothers>,
    alerts: Mutex<AlertCenter>,
}

impl HealthMonitor {
    pub fn new(
        connections: Arc<ConnectionManager>,
        thresholds: HealthThresholds,
        sample_interval: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            connections,
            thresholds,
            sample_interval,
            smoothers: Mutex::new(Smoothers {
                latency: Ema::new(0.3),
                error_rate: Ema::new(0.3),
                reconnect: Ema::new(0.3),
            }),
            alerts: Mutex::new(AlertCenter::new(cooldown)),
        }
    }

    /// One sampling pass: smooth, classify, alert.
    pub fn sample(&self) -> HealthSnapshot {
        let stats = self.connections.stats();
        self.evaluate(&stats)
    }

    fn evaluate(&self, stats: &ConnectionStats) -> HealthSnapshot {
        let total = stats.total_sessions.max(1) as f64;
        let healthy = stats
            .quality_counts
            .get(&ConnectionQuality::Excellent)
            .copied()
            .unwrap_or(0)
            + stats
                .quality_counts
                .get(&ConnectionQuality::Good)
                .copied()
                .unwrap_or(0);
        let quality_ratio = if stats.total_sessions == 0 {
            1.0
        } else {
            healthy as f64 / total
        };
        let raw_reconnect = stats.reconnecting as f64 / total;
        let raw_error = 1.0 - stats.sync_success_rate();

        let (latency, error_rate, reconnect_ratio) = {
            let mut s = self.smoothers.lock();
            (
                s.latency.update(stats.avg_latency_ms),
                s.error_rate.update(raw_error),
                s.reconnect.update(raw_reconnect),
            )
        };

        // Blended load proxy: utilization against capacity plus churn.
        let utilization = stats.total_sessions as f64 / self.thresholds.capacity_hint.max(1) as f64;
        let load = (0.5 * utilization + 0.5 * reconnect_ratio).clamp(0.0, 1.0);

        // The reconnect path slows down under load and degraded quality.
        self.connections.set_adaptive_factors(AdaptiveFactors {
            system_load: 1.0 + load,
            network_quality: 1.0 + (1.0 - quality_ratio),
        });

        let mut alerts = Vec::new();
        {
            let mut center = self.alerts.lock();
            let evaluations = [
                (
                    AlertType::HighLatency,
                    severity_over(latency, self.thresholds.latency_ms),
                    latency,
                    self.thresholds.latency_ms,
                ),
                (
                    AlertType::HighErrorRate,
                    severity_over(error_rate, self.thresholds.error_rate),
                    error_rate,
                    self.thresholds.error_rate,
                ),
                (
                    AlertType::LowConnectionQuality,
                    severity_under(quality_ratio, self.thresholds.quality_ratio),
                    quality_ratio,
                    self.thresholds.quality_ratio,
                ),
                (
                    AlertType::SystemOverload,
                    severity_over(load, self.thresholds.load),
                    load,
                    self.thresholds.load,
                ),
            ];
            for (alert_type, severity, value, threshold) in evaluations {
                match severity {
                    Some(severity) => {
                        let candidate = Alert {
                            alert_type,
                            severity,
                            message: format!("{alert_type:?} at {value:.3} against {threshold}"),
                            value,
                            threshold,
                        };
                        if let Some(alert) = center.observe(Some(candidate)) {
                            warn!(
                                alert = ?alert.alert_type,
                                severity = ?alert.severity,
                                value = alert.value,
                                "Health alert"
                            );
                            alerts.push(alert);
                        }
                    }
                    None => center.clear(alert_type),
                }
            }
        }

        HealthSnapshot {
            sessions: stats.total_sessions,
            latency_ms: latency,
            error_rate,
            reconnect_ratio,
            quality_ratio,
            load,
            uptime: stats.sync_success_rate(),
            alerts,
        }
    }

    /// Sampling loop until shutdown.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.sample_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let snapshot = monitor.sample();
                        info!(
                            sessions = snapshot.sessions,
                            latency_ms = snapshot.latency_ms,
                            load = snapshot.load,
                            uptime = snapshot.uptime,
                            alerts = snapshot.alerts.len(),
                            "Health sample"
                        );
                    }
                    _ = shutdown.changed() => {
                        debug!("Health monitor stopping");
                        break;
                    }
                }
            }
        })
    }
}
