//! Retry of transient failures with jittered exponential backoff.
//!
//! The schedule matches the reconnection path: `base * factor^(n-1)` capped
//! at `max_delay`, with optional ±20% jitter and a 100 ms floor.

use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::error::{Error, Result};

/// Jitter applied when enabled, as a fraction of the delay.
pub const JITTER_FRACTION: f64 = 0.2;

/// Minimum delay between attempts.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Backoff schedule shared by retries and reconnection.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(250),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base.as_millis() as f64 * exp;
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter {
            let spread = capped * JITTER_FRACTION;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64).max(MIN_DELAY)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts.
/// Only `Transient` errors are retried.
pub async fn with_retry<T, F, Fut>(label: &str, policy: BackoffPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
