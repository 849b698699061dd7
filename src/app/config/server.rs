//! Listener and cluster identity configuration.

use serde::Deserialize;

/// Network listeners and node capacity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host for both listeners (`SERVER_HOST`).
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP surface port (`SERVER_PORT`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket gateway port (`WS_PORT`).
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Node-local socket ceiling (`WS_MAX_CONNECTIONS`).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Optional placement hints for the registry record.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_ws_port() -> u16 {
    8081
}

const fn default_max_connections() -> usize {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_port: default_ws_port(),
            max_connections: default_max_connections(),
            region: None,
            zone: None,
        }
    }
}

/// Backing services.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Redis endpoint (`REDIS_URL`). Absent means the in-process
    /// implementations back the log and KV (single-node demo mode).
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Relational endpoint (`DATABASE_URL`), consumed by whichever Store
    /// implementation is wired in by the deployment.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Credential verification configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// RSA public key PEM (`JWT_PUBLIC_KEY`).
    #[serde(default)]
    pub jwt_public_key: Option<String>,
    /// HS256 shared secret, for tests and demo deployments.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Accept explicit `{organizationId, userId?}` demo credentials.
    #[serde(default)]
    pub allow_demo: bool,
}
