//! Health monitoring configuration with environment overrides.
//!
//! Deployment tooling overrides timeouts and thresholds without touching
//! the TOML via `MONITORING_TIMEOUTS_*` and `MONITORING_THRESHOLDS_*`.

use serde::Deserialize;
use tokio::time::Duration;
use tracing::warn;

use crate::core::health::HealthThresholds;

/// Monitoring cadence and alert thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSettings {
    /// Sampling interval (`MONITORING_TIMEOUTS_SAMPLE_SECS`).
    #[serde(default = "default_sample_secs")]
    pub sample_interval_secs: u64,
    /// Alert re-notification cooldown (`MONITORING_TIMEOUTS_COOLDOWN_SECS`).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// HIGH_LATENCY threshold (`MONITORING_THRESHOLDS_LATENCY_MS`).
    #[serde(default = "default_latency_ms")]
    pub latency_ms: f64,
    /// HIGH_ERROR_RATE threshold (`MONITORING_THRESHOLDS_ERROR_RATE`).
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// LOW_CONNECTION_QUALITY threshold
    /// (`MONITORING_THRESHOLDS_QUALITY_RATIO`).
    #[serde(default = "default_quality_ratio")]
    pub quality_ratio: f64,
    /// SYSTEM_OVERLOAD threshold (`MONITORING_THRESHOLDS_LOAD`).
    #[serde(default = "default_load")]
    pub load: f64,
}

const fn default_sample_secs() -> u64 {
    30
}

const fn default_cooldown_secs() -> u64 {
    300
}

const fn default_latency_ms() -> f64 {
    500.0
}

const fn default_error_rate() -> f64 {
    0.05
}

const fn default_quality_ratio() -> f64 {
    0.7
}

const fn default_load() -> f64 {
    0.8
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_secs(),
            cooldown_secs: default_cooldown_secs(),
            latency_ms: default_latency_ms(),
            error_rate: default_error_rate(),
            quality_ratio: default_quality_ratio(),
            load: default_load(),
        }
    }
}

impl MonitoringSettings {
    /// Apply `MONITORING_TIMEOUTS_*` / `MONITORING_THRESHOLDS_*` overrides.
    pub fn apply_env_overrides(&mut self) {
        override_from_env("MONITORING_TIMEOUTS_SAMPLE_SECS", &mut self.sample_interval_secs);
        override_from_env("MONITORING_TIMEOUTS_COOLDOWN_SECS", &mut self.cooldown_secs);
        override_from_env("MONITORING_THRESHOLDS_LATENCY_MS", &mut self.latency_ms);
        override_from_env("MONITORING_THRESHOLDS_ERROR_RATE", &mut self.error_rate);
        override_from_env("MONITORING_THRESHOLDS_QUALITY_RATIO", &mut self.quality_ratio);
        override_from_env("MONITORING_THRESHOLDS_LOAD", &mut self.load);
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn to_thresholds(&self, capacity_hint: usize) -> HealthThresholds {
        HealthThresholds {
            latency_ms: self.latency_ms,
            error_rate: self.error_rate,
            quality_ratio: self.quality_ratio,
            load: self.load,
            capacity_hint,
        }
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(var = name, value = %raw, "Unparsable monitoring override ignored"),
    }
}
