//! Configuration readiness checks for the `check` subcommand.

use url::Url;

use crate::app::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CheckItem {
    name: &'static str,
    critical: bool,
    status: CheckStatus,
}

impl CheckItem {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn critical(&self) -> bool {
        self.critical
    }

    pub fn status(&self) -> &CheckStatus {
        &self.status
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, CheckStatus::Ok)
    }
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    items: Vec<CheckItem>,
}

impl CheckReport {
    pub fn items(&self) -> &[CheckItem] {
        &self.items
    }

    pub fn is_ok(&self) -> bool {
        self.items
            .iter()
            .filter(|item| item.critical())
            .all(CheckItem::is_ok)
    }
}

/// Evaluate a loaded configuration for readiness.
pub fn check_config(config: &Config) -> CheckReport {
    let mut items = Vec::new();

    items.push(CheckItem {
        name: "listeners",
        critical: true,
        status: if config.server.port == config.server.ws_port {
            CheckStatus::Failed("SERVER_PORT and WS_PORT collide".to_string())
        } else {
            CheckStatus::Ok
        },
    });

    items.push(CheckItem {
        name: "credentials",
        critical: true,
        status: if config.auth.jwt_public_key.is_none()
            && config.auth.jwt_secret.is_none()
            && !config.auth.allow_demo
        {
            CheckStatus::Failed("no JWT key and demo mode disabled".to_string())
        } else {
            CheckStatus::Ok
        },
    });

    items.push(CheckItem {
        name: "redis",
        critical: false,
        status: match &config.backend.redis_url {
            None => CheckStatus::Failed("no REDIS_URL, running in-process only".to_string()),
            Some(url) => match Url::parse(url) {
                Ok(parsed) if parsed.scheme().starts_with("redis") => CheckStatus::Ok,
                Ok(parsed) => {
                    CheckStatus::Failed(format!("unexpected scheme '{}'", parsed.scheme()))
                }
                Err(e) => CheckStatus::Failed(format!("unparsable REDIS_URL: {e}")),
            },
        },
    });

    items.push(CheckItem {
        name: "heartbeat",
        critical: true,
        status: if config.connections.heartbeat_interval_secs == 0 {
            CheckStatus::Failed("heartbeat interval cannot be zero".to_string())
        } else {
            CheckStatus::Ok
        },
    });

    items.push(CheckItem {
        name: "reconnect",
        critical: true,
        status: if config.connections.reconnect.max_attempts == 0 {
            CheckStatus::Failed("max reconnect attempts cannot be zero".to_string())
        } else {
            CheckStatus::Ok
        },
    });

    CheckReport { items }
}

/// Print the report; returns the process exit code.
pub fn execute(config: &Config) -> i32 {
    let report = check_config(config);
    for item in report.items() {
        let marker = if item.is_ok() { "ok" } else { "FAIL" };
        match item.status() {
            CheckStatus::Ok => println!("{:<12} {marker}", item.name()),
            CheckStatus::Failed(reason) => {
                println!("{:<12} {marker}  {reason}", item.name());
            }
        }
    }
    if report.is_ok() {
        println!("configuration ok");
        0
    } else {
        println!("configuration has critical failures");
        1
    }
}
