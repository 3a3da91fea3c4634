//! # Huntsman Coordinator
//!
//! Runs one orchestration coordinator: queue worker, cron scheduler and
//! maintenance sweeps, against PostgreSQL when `database.url` is set and
//! the in-memory store otherwise. `validate` loads and checks the
//! configuration without starting anything.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use huntsman_core::config::ConfigManager;
use huntsman_core::flows::FlowRegistry;
use huntsman_core::logging::init_structured_logging;
use huntsman_core::orchestration::{connect_store, LoggingTransport, OrchestrationSystem};

#[derive(Parser)]
#[command(name = "huntsman-server")]
#[command(about = "Run a Huntsman orchestration coordinator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: $HUNTSMAN_CONFIG_DIR or ./config)
    #[arg(short, long, env = "HUNTSMAN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Environment overlay to load (default: $HUNTSMAN_ENV or development)
    #[arg(short, long)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until Ctrl-C (default)
    Run,

    /// Load and validate configuration, print it, and exit
    Validate,

    /// List the registered flow types
    Flows,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let manager = match &cli.environment {
        Some(environment) => ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment),
        None => ConfigManager::load_from_directory(cli.config_dir.clone()),
    }
    .context("failed to load configuration")?;
    let registry = FlowRegistry::with_builtin_flows().context("failed to build flow registry")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => {
            println!("✅ Configuration valid for environment {}", manager.environment());
            println!("{}", serde_json::to_string_pretty(manager.config())?);
            Ok(())
        }
        Commands::Flows => {
            for flow_type in registry.flow_types() {
                println!("{flow_type}");
            }
            Ok(())
        }
        Commands::Run => {
            let config = manager.config().clone();
            let store = connect_store(&config)
                .await
                .context("failed to connect to the store")?;
            let system = Arc::new(OrchestrationSystem::new(
                config,
                store,
                registry,
                Arc::new(LoggingTransport),
            ));

            let running = {
                let system = system.clone();
                tokio::spawn(async move { system.run().await })
            };

            signal::ctrl_c().await?;
            info!("Shutdown signal received");
            system.shutdown();
            running.await?;
            info!("Coordinator stopped");
            Ok(())
        }
    }
}
