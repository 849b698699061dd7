//! Reconnection delay strategies.
//!
//! The default schedule is exponential: `base * factor^(attempt-1)` capped
//! at `max_delay`. LINEAR and FIXED exist for SDKs that want predictable
//! pacing, and ADAPTIVE scales the exponential delay by observed system
//! load and network quality.

use rand::Rng;
use tokio::time::Duration;

/// Floor applied to every computed delay.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Jitter fraction when enabled.
pub const JITTER_FRACTION: f64 = 0.2;

/// Cap on the combined ADAPTIVE multiplier.
pub const ADAPTIVE_CAP: f64 = 3.0;

/// Delay strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Adaptive,
}

/// Reconnection schedule parameters.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub strategy: ReconnectStrategy,
    pub base: Duration,
    pub factor: f64,
    /// Per-attempt increment for LINEAR.
    pub increment: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
    /// Stable-connection span after which the attempt counter resets.
    pub reset_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Exponential,
            base: Duration::from_secs(1),
            factor: 2.0,
            increment: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: false,
            reset_after: Duration::from_secs(300),
        }
    }
}

/// Load/quality inputs for the ADAPTIVE strategy, each clamped to [1, 2].
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveFactors {
    pub system_load: f64,
    pub network_quality: f64,
}

impl Default for AdaptiveFactors {
    fn default() -> Self {
        Self {
            system_load: 1.0,
            network_quality: 1.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, factors: AdaptiveFactors) -> Duration {
        let n = attempt.max(1);
        let base_ms = self.base.as_millis() as f64;

        let raw_ms = match self.strategy {
            ReconnectStrategy::Exponential => base_ms * self.factor.powi((n - 1) as i32),
            ReconnectStrategy::Linear => {
                base_ms + self.increment.as_millis() as f64 * f64::from(n - 1)
            }
            ReconnectStrategy::Fixed => base_ms,
            ReconnectStrategy::Adaptive => {
                let exp = base_ms * self.factor.powi((n - 1) as i32);
                let load = factors.system_load.clamp(1.0, 2.0);
                let net = factors.network_quality.clamp(1.0, 2.0);
                exp * (load * net).min(ADAPTIVE_CAP)
            }
        };

        let capped = raw_ms.min(self.max_delay.as_millis() as f64);
        let final_ms = if self.jitter {
            let spread = capped * JITTER_FRACTION;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(final_ms as u64).max(MIN_RECONNECT_DELAY)
    }

    /// True once `attempt` exceeds the configured budget.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
