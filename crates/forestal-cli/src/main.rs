use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forestal_storage::PgDocumentStore;
use forestal_sync::{EtlPipeline, RunOptions, RunOutcome, SyncConfig};
use forestal_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "forestal-cli")]
#[command(about = "Gestión Forestal work-order backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ETL sync against the upstream GIS API.
    Sync {
        /// Override the watermark date (YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,
        /// Resync from the configured epoch date.
        #[arg(long)]
        force: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP API, with the in-process scheduler when enabled.
    Serve,
}

/// `RUST_LOG` first, then `LOG_LEVEL`, else `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        from: None,
        force: false,
    }) {
        Commands::Sync { from, force } => {
            match forestal_sync::run_sync_once_from_env(&RunOptions { from, force }).await? {
                RunOutcome::Completed(summary) => {
                    info!(
                        run_id = %summary.run_id,
                        started_at = %summary.started_at.to_rfc3339(),
                        finished_at = %summary.finished_at.to_rfc3339(),
                        "sync finished"
                    );
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                RunOutcome::AlreadyRunning => {
                    warn!("another etl run is in progress");
                    return Ok(ExitCode::from(2));
                }
            }
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
            let store = PgDocumentStore::connect(&url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let config = SyncConfig::from_env()?;
            info!(config = ?config, "loaded configuration");
            let store = forestal_sync::open_store(&config).await?;
            let pipeline = Arc::new(EtlPipeline::from_config(&config, store)?);

            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting etl scheduler")?;
            }

            let state = AppState::from_config(&config, pipeline);
            forestal_web::serve(state, &config.bind_addr()).await?;

            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
