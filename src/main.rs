//! bootcache - boot-time kernel cache maintenance
//!
//! CLI entry point that dispatches to subcommands.

use bootcache::cli::{Cli, Commands};
use bootcache::config::ConfigManager;
use bootcache::error::BootcacheResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> BootcacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("bootcache=warn"),
        1 => EnvFilter::new("bootcache=info"),
        _ => EnvFilter::new("bootcache=debug"),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Check(args) => bootcache::cli::commands::check(args, &config).await,
        Commands::Update(args) => bootcache::cli::commands::update(args, &config).await,
        Commands::Build(args) => bootcache::cli::commands::build(args, &config).await,
        Commands::Inspect(args) => bootcache::cli::commands::inspect(args).await,
        Commands::Daemon(args) => {
            bootcache::cli::commands::daemon(args, &config, cli.config.clone()).await
        }
        Commands::Config(args) => {
            bootcache::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
