use std::sync::Arc;

use anyhow::{bail, Context, Result};
use carlot_storage::{CatalogStore, PgStore};
use carlot_sync::{open_store, CycleScheduler, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "carlot-cli")]
#[command(about = "Live vehicle auction catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a cycle now and then on every interval until Ctrl-C.
    Run {
        /// Also serve the read API from the same catalog.
        #[arg(long)]
        serve: bool,
    },
    /// Run a single cycle and print its stats.
    Once,
    /// Apply database migrations.
    Migrate,
    /// Serve the read API.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

/// Connect to the configured database and apply migrations.
async fn postgres(config: &SyncConfig, purpose: &str) -> Result<Arc<dyn CatalogStore>> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set to {purpose}");
    };
    let store = PgStore::connect(url).await.context("connecting to postgres")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Run { serve } => {
            let store = open_store(&config).await?;
            let pipeline = SyncPipeline::from_config(&config, Arc::clone(&store))?;
            let scheduler = CycleScheduler::new(Arc::new(pipeline), config.cycle_interval);
            if serve {
                let port = carlot_web::port_from_env();
                tokio::spawn(async move {
                    if let Err(err) = carlot_web::serve(store, port).await {
                        error!(error = %err, "read api stopped");
                    }
                });
            }
            scheduler.run_until_shutdown().await?;
        }
        Commands::Once => {
            let store = open_store(&config).await?;
            let pipeline = SyncPipeline::from_config(&config, store)?;
            let report = pipeline.run_cycle().await?;
            let stats = report.reconcile.unwrap_or_default();
            let drain = report.drain.unwrap_or_default();
            println!(
                "cycle complete: cycle_id={} backend={} new={} updated={} closed={} enriched={}/{}",
                report.cycle_id,
                report.backend,
                stats.new,
                stats.updated,
                stats.closed,
                drain.enriched,
                drain.attempted
            );
        }
        Commands::Migrate => {
            postgres(&config, "run migrations").await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let purpose = "serve the catalog (`run --serve` serves an in-memory one)";
            let store = postgres(&config, purpose).await?;
            carlot_web::serve(store, carlot_web::port_from_env()).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serving_without_a_database_is_refused() {
        let err = postgres(&SyncConfig::default(), "serve").await.err().unwrap();
        assert!(err.to_string().contains("DATABASE_URL must be set to serve"));
    }

    #[test]
    fn bare_invocation_runs_one_cycle() {
        let cli = Cli::try_parse_from(["carlot-cli"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["carlot-cli", "run", "--serve"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { serve: true })));
    }
}
