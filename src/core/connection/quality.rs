//! Deterministic quality classification and adaptive heartbeat pacing.

use tokio::time::Duration;

use crate::core::domain::ConnectionQuality;

/// Latency above which a session is no longer EXCELLENT.
pub const LATENCY_GOOD_MS: u64 = 500;
/// Latency above which a session is POOR regardless of heartbeats.
pub const LATENCY_POOR_MS: u64 = 1000;

/// Heartbeat interval bounds after adaptation.
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Interval change below this is ignored (hysteresis).
pub const RESTART_HYSTERESIS: Duration = Duration::from_secs(5);

/// Classify a session's network condition.
///
/// The rules are ordered: missed heartbeats dominate, then latency.
#[must_use]
pub fn classify(missed_heartbeats: u32, latency_ms: u64) -> ConnectionQuality {
    if missed_heartbeats > 2 {
        ConnectionQuality::Critical
    } else if missed_heartbeats > 1 {
        ConnectionQuality::Poor
    } else if latency_ms > LATENCY_POOR_MS {
        ConnectionQuality::Poor
    } else if latency_ms > LATENCY_GOOD_MS {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Excellent
    }
}

/// Adapt the heartbeat interval to the observed quality.
///
/// CRITICAL halves the interval, POOR uses 0.75x, EXCELLENT relaxes to
/// 1.5x; the result is clamped to `[MIN_INTERVAL, MAX_INTERVAL]`.
#[must_use]
pub fn adaptive_interval(base: Duration, quality: ConnectionQuality) -> Duration {
    let scaled = match quality {
        ConnectionQuality::Critical => base.mul_f64(0.5),
        ConnectionQuality::Poor => base.mul_f64(0.75),
        ConnectionQuality::Good => base,
        ConnectionQuality::Excellent => base.mul_f64(1.5),
    };
    scaled.clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Whether the heartbeat timer should be restarted for a new interval.
///
/// Restarting is worth it only when the interval moved by at least
/// [`RESTART_HYSTERESIS`].
#[must_use]
pub fn should_restart_timer(current: Duration, next: Duration) -> bool {
    let diff = if next > current {
        next - current
    } else {
        current - next
    };
    diff >= RESTART_HYSTERESIS
}

/// Latency ceiling considered normal for a quality tier; a spike past
/// twice this forces a database sync.
#[must_use]
pub fn latency_threshold_ms(quality: ConnectionQuality) -> u64 {
    match quality {
        ConnectionQuality::Excellent => LATENCY_GOOD_MS,
        ConnectionQuality::Good => LATENCY_POOR_MS,
        ConnectionQuality::Poor | ConnectionQuality::Critical => 2 * LATENCY_POOR_MS,
    }
}
