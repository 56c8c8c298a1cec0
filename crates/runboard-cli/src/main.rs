use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use runboard_storage::SyncStore;
use runboard_sync::{full_refresh_start, runs_refresh_start, synchronizer_from_config, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "runboard")]
#[command(about = "Mirror pipeline runs from the orchestration API and serve the latest state")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and print its summary.
    Sync {
        /// Only backfill runs; skip projects, environments and jobs.
        #[arg(long)]
        runs_only: bool,
        /// Load runs started within this many days.
        #[arg(long)]
        since_days: Option<u32>,
        /// Ignore the stored watermark when backfilling.
        #[arg(long)]
        no_watermark: bool,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Serve the JSON API, with the scheduled refresh when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync {
            runs_only,
            since_days,
            no_watermark,
        } => {
            let config = SyncConfig::from_env()?;
            let synchronizer = synchronizer_from_config(&config).await?;
            let now = Utc::now();

            if runs_only {
                let start = since_days
                    .map(|days| now - Duration::days(i64::from(days)))
                    .unwrap_or_else(|| runs_refresh_start(now));
                let summary = synchronizer.backfill_runs(start, !no_watermark).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let start = since_days
                    .map(|days| now - Duration::days(i64::from(days)))
                    .unwrap_or_else(|| full_refresh_start(now));
                if no_watermark {
                    info!("--no-watermark only applies with --runs-only");
                }
                let summary = synchronizer.full_refresh(start).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }

            let counts = synchronizer.store().table_counts().await?;
            println!(
                "store: projects={} environments={} jobs={} runs={}",
                counts.projects, counts.environments, counts.jobs, counts.runs
            );
        }
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
            let store = SyncStore::connect(&database_url).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied to {database_url}");
        }
        Commands::Serve => runboard_web::serve_from_env().await?,
    }

    Ok(())
}
