//! Application configuration loading and validation.
//!
//! Configuration is loaded from a TOML file with environment variable
//! overrides for deployment-specific values (`REDIS_URL`, `DATABASE_URL`,
//! `JWT_PUBLIC_KEY`, `SERVER_HOST`, `SERVER_PORT`, `WS_PORT`,
//! `WS_MAX_CONNECTIONS`, `MONITORING_*`).
//!
//! # Example
//!
//! ```no_run
//! use axonpuls::app::config::Config;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config.toml")?;
//!     config.init_logging();
//!     Ok(())
//! }
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::connection::{ConnectionSettings, RateLimitSettings};
use super::logging::LoggingConfig;
use super::monitoring::MonitoringSettings;
use super::server::{AuthConfig, BackendConfig, ServerConfig};
use crate::error::{Error, Result};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub connections: ConnectionSettings,

    #[serde(default)]
    pub rate_limits: RateLimitSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides. A missing
    /// file yields the defaults (environment-only deployments).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load_lenient(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load without the validation pass, for `check`-style tooling that
    /// wants to report every problem instead of failing on the first.
    pub fn load_lenient(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            Self::parse_toml(&raw)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("bad config file: {e}")))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(port) = std::env::var("WS_PORT") {
            if let Ok(port) = port.parse() {
                self.server.ws_port = port;
            }
        }
        if let Ok(max) = std::env::var("WS_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                self.server.max_connections = max;
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.backend.redis_url = Some(url);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.backend.database_url = Some(url);
        }
        if let Ok(pem) = std::env::var("JWT_PUBLIC_KEY") {
            self.auth.jwt_public_key = Some(pem);
        }
        self.monitoring.apply_env_overrides();
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == self.server.ws_port {
            return Err(Error::Config(format!(
                "SERVER_PORT and WS_PORT are both {}",
                self.server.port
            )));
        }
        if self.auth.jwt_public_key.is_none()
            && self.auth.jwt_secret.is_none()
            && !self.auth.allow_demo
        {
            return Err(Error::Config(
                "no JWT key configured and demo mode is disabled".into(),
            ));
        }
        if self.connections.max_missed_heartbeats == 0 {
            return Err(Error::Config(
                "max_missed_heartbeats must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn init_logging(&self) {
        self.logging.init();
    }
}
