//! Connection lifecycle and rate limit configuration.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::time::Duration;

use crate::core::connection::{ConnectionConfig, ReconnectPolicy, ReconnectStrategy};
use crate::core::limiter::RateLimitConfig;

/// Heartbeat, staleness and reconnection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_max_missed_heartbeats() -> u32 {
    3
}

const fn default_stale_after_secs() -> u64 {
    3600
}

const fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            stale_after_secs: default_stale_after_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn to_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            max_missed_heartbeats: self.max_missed_heartbeats,
            stale_after: Duration::from_secs(self.stale_after_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            reconnect: self.reconnect.to_policy(),
            ..ConnectionConfig::default()
        }
    }
}

/// Reconnection schedule settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default)]
    pub strategy: ReconnectStrategy,
    #[serde(default = "default_reconnect_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_reconnect_factor")]
    pub factor: f64,
    #[serde(default = "default_reconnect_increment_ms")]
    pub increment_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default = "default_reset_after_secs")]
    pub reset_after_secs: u64,
}

const fn default_reconnect_base_ms() -> u64 {
    1000
}

const fn default_reconnect_factor() -> f64 {
    2.0
}

const fn default_reconnect_increment_ms() -> u64 {
    1000
}

const fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

const fn default_reconnect_max_attempts() -> u32 {
    5
}

const fn default_reset_after_secs() -> u64 {
    300
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::default(),
            base_ms: default_reconnect_base_ms(),
            factor: default_reconnect_factor(),
            increment_ms: default_reconnect_increment_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: default_reconnect_max_attempts(),
            jitter: false,
            reset_after_secs: default_reset_after_secs(),
        }
    }
}

impl ReconnectSettings {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            strategy: self.strategy,
            base: Duration::from_millis(self.base_ms),
            factor: self.factor,
            increment: Duration::from_millis(self.increment_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            jitter: self.jitter,
            reset_after: Duration::from_secs(self.reset_after_secs),
        }
    }
}

/// Rate limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_socket_messages")]
    pub socket_messages: u32,
    #[serde(default = "default_socket_window_secs")]
    pub socket_window_secs: u64,
    #[serde(default = "default_action_limit")]
    pub default_action_limit: u32,
    #[serde(default = "default_action_window_secs")]
    pub action_window_secs: u64,
    /// Per-action steady-rate overrides.
    #[serde(default)]
    pub action_limits: HashMap<String, u32>,
}

const fn default_socket_messages() -> u32 {
    100
}

const fn default_socket_window_secs() -> u64 {
    60
}

const fn default_action_limit() -> u32 {
    120
}

const fn default_action_window_secs() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            socket_messages: default_socket_messages(),
            socket_window_secs: default_socket_window_secs(),
            default_action_limit: default_action_limit(),
            action_window_secs: default_action_window_secs(),
            action_limits: HashMap::new(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            socket_messages: self.socket_messages,
            socket_window: Duration::from_secs(self.socket_window_secs),
            action_limits: self.action_limits.clone(),
            default_action_limit: self.default_action_limit,
            action_window: Duration::from_secs(self.action_window_secs),
        }
    }
}
