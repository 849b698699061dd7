//! Application configuration.

mod connection;
mod logging;
mod monitoring;
mod server;
mod settings;

pub use connection::{ConnectionSettings, RateLimitSettings, ReconnectSettings};
pub use logging::LoggingConfig;
pub use monitoring::MonitoringSettings;
pub use server::{AuthConfig, BackendConfig, ServerConfig};
pub use settings::Config;
