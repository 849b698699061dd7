//! Command-line interface definitions.

pub mod check;
pub mod run;
pub mod status;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AxonPuls - multi-tenant real-time messaging and collaboration server.
#[derive(Parser, Debug)]
#[command(name = "axonpuls")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Override log level (debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Use JSON log format instead of pretty
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the server (foreground)
    Run(RunArgs),

    /// Validate the configuration and print a readiness report
    Check,

    /// Show the cluster registry (active nodes and load)
    Status,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Accept demo credentials even if the config says otherwise
    #[arg(long)]
    pub allow_demo: bool,
}
