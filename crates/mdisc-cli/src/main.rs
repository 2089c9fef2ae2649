use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mdisc_storage::{SqliteVenueStore, VenueStore};
use mdisc_sync::{IngestOutcome, IngestionService, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "mdisc=info,tower_http=info,warn";

#[derive(Debug, Parser)]
#[command(name = "mdisc")]
#[command(about = "Munich Discovery venue backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the daily refresh scheduler.
    Serve,
    /// Run one ingestion cycle and exit.
    Sync,
    /// Reload the store from the JSON snapshot file.
    Restore,
    Migrate,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn VenueStore>> {
    let store = SqliteVenueStore::connect(&config.database_url).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            mdisc_web::serve_from_env().await?;
        }
        Commands::Sync => {
            let config = SyncConfig::from_env();
            let ingestion = IngestionService::from_config(&config, open_store(&config).await?)?;
            match ingestion.fetch_and_store().await? {
                IngestOutcome::Fresh { venues } => {
                    println!(
                        "sync complete: venues={} last_updated={}",
                        venues.len(),
                        ingestion.last_update_time().await
                    );
                }
                IngestOutcome::Stale { venues, reason } => {
                    println!("sync failed, store unchanged: stored={} reason={reason}", venues.len());
                }
            }
        }
        Commands::Restore => {
            let config = SyncConfig::from_env();
            let ingestion = IngestionService::from_config(&config, open_store(&config).await?)?;
            match ingestion.restore_from_snapshot().await? {
                Some(count) => println!("restored {count} venues from {}", config.snapshot_path.display()),
                None => println!("no snapshot at {}", config.snapshot_path.display()),
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            open_store(&config).await?;
            info!(database_url = %config.database_url, "migrations applied");
            println!("migrations applied");
        }
    }

    Ok(())
}
