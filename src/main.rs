use clap::Parser;

use axonpuls::app::config::Config;
use axonpuls::cli::{check, run, status, Cli, Commands};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = match Config::load_lenient(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.format = "json".into();
    }
    config.init_logging();

    let code = match &cli.command {
        Commands::Run(args) => {
            if let Err(e) = config.validate() {
                eprintln!("Configuration error: {e}");
                std::process::exit(1);
            }
            run::execute(config, args).await
        }
        Commands::Check => check::execute(&config),
        Commands::Status => status::execute(&config).await,
    };
    std::process::exit(code);
}
