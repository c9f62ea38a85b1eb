use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carwatch_sync::CarwatchConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "carwatch")]
#[command(about = "Watches classifieds listings and notifies on new listings and price drops")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a single reconciliation run.
    Run,
    /// Start a run on every tick of CARWATCH_SCHEDULE until interrupted.
    Schedule,
    /// Create or upgrade the store schema.
    Migrate,
    /// Replace stored watches and rules with a YAML catalog.
    Seed {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carwatch=info,carwatch_sync=info,carwatch_storage=info,carwatch_adapters=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = carwatch_sync::run_once_from_env().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
        }
        Commands::Schedule => {
            let config = CarwatchConfig::from_env();
            let orchestrator = Arc::new(carwatch_sync::build_orchestrator(&config).await?);
            let mut sched = carwatch_sync::build_scheduler(&config.schedule, orchestrator).await?;
            sched.start().await.context("starting scheduler")?;
            info!(schedule = %config.schedule, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Migrate => {
            carwatch_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Seed { file } => {
            let config = CarwatchConfig::from_env();
            let catalog = carwatch_sync::seed_catalog_from_file(&config, &file).await?;
            println!(
                "catalog seeded: watches={} rules={}",
                catalog.watches.len(),
                catalog.rules.len()
            );
        }
    }

    Ok(())
}
