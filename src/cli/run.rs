//! The `run` subcommand: build the runtime and serve until a signal.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use super::RunArgs;
use crate::app::config::Config;
use crate::app::runtime::ServerRuntime;
use crate::core::store::MemoryStore;
use crate::error::Result;

/// Exit code for a clean stop.
pub const EXIT_OK: i32 = 0;
/// Exit code for a fatal runtime failure.
pub const EXIT_FATAL: i32 = 2;
/// Exit code when terminated by a signal.
pub const EXIT_SIGNAL: i32 = 130;

pub async fn execute(mut config: Config, args: &RunArgs) -> i32 {
    if args.allow_demo {
        config.auth.allow_demo = true;
    }

    match serve(config).await {
        Ok(interrupted) => {
            if interrupted {
                EXIT_SIGNAL
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            error!(error = %e, "Fatal runtime error");
            EXIT_FATAL
        }
    }
}

/// Run the server; returns whether a signal stopped it.
async fn serve(config: Config) -> Result<bool> {
    // The relational store is an external collaborator; this process ships
    // with the in-memory implementation.
    let store = Arc::new(MemoryStore::new());
    let runtime = ServerRuntime::build(config, store).await?;
    let shutdown = runtime.shutdown_handle();

    let mut server = tokio::spawn(runtime.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = shutdown.send(true);
            join_server(server).await?;
            Ok(true)
        }
        result = &mut server => {
            flatten_join(result)?;
            Ok(false)
        }
    }
}

async fn join_server(server: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    flatten_join(server.await)
}

fn flatten_join(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(crate::error::Error::Fatal(format!(
            "server task panicked: {e}"
        ))),
    }
}
