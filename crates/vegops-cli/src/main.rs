use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use vegops_adapters::FetchFilters;
use vegops_core::SyncTrigger;

#[derive(Debug, Parser)]
#[command(name = "vegops-cli")]
#[command(about = "Vegetation-management work order pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync circuits from the work-management source, then run the delayed
    /// aggregate follow-up.
    Sync {
        /// Status codes to sync (repeatable); empty means everything.
        #[arg(long = "status")]
        statuses: Vec<String>,
        /// Explicit work-order ids to sync (repeatable).
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Overwrite user-modified fields and clear their tracking.
        #[arg(long)]
        force: bool,
    },
    /// Run only the aggregate-sync pass.
    Aggregates,
    /// Capture today's circuit snapshots.
    Snapshots {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Build the planner and regional daily rollups.
    RollupDaily {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Build the planner and regional weekly rollups.
    RollupWeekly {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Delete snapshots and sync runs past the retention window.
    Prune,
    /// Apply pending database migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync {
        statuses: vec![],
        ids: vec![],
        force: false,
    }) {
        Commands::Sync {
            statuses,
            ids,
            force,
        } => {
            let filters = FetchFilters {
                statuses,
                external_ids: ids,
            };
            let run = vegops_sync::run_full_sync_from_env(filters, force, SyncTrigger::Manual)
                .await?;
            println!(
                "sync complete: run_id={} status={} processed={} created={} updated={} aggregates={}",
                run.id,
                run.status.as_str(),
                run.counts.processed,
                run.counts.created,
                run.counts.updated,
                run.counts.aggregates_created
            );
        }
        Commands::Aggregates => {
            let run = vegops_sync::run_aggregate_sync_from_env(SyncTrigger::Manual).await?;
            println!(
                "aggregate sync complete: run_id={} status={} aggregates={} snapshots={}",
                run.id,
                run.status.as_str(),
                run.counts.aggregates_created,
                run.counts.snapshots_created
            );
        }
        Commands::Snapshots { date } => {
            let date = date.unwrap_or_else(vegops_sync::today);
            let run =
                vegops_sync::run_daily_snapshots_from_env(date, SyncTrigger::Manual).await?;
            println!(
                "daily snapshots complete: run_id={} status={} created={} skipped={}",
                run.id,
                run.status.as_str(),
                run.counts.snapshots_created,
                run.counts.skipped
            );
        }
        Commands::RollupDaily { date } => {
            let date = date.unwrap_or_else(vegops_sync::today);
            let run = vegops_sync::run_daily_rollup_from_env(date, SyncTrigger::Manual).await?;
            println!(
                "daily rollup complete: run_id={} status={} rows={}",
                run.id,
                run.status.as_str(),
                run.counts.aggregates_created
            );
        }
        Commands::RollupWeekly { date } => {
            let date = date.unwrap_or_else(vegops_sync::today);
            let run = vegops_sync::run_weekly_rollup_from_env(date, SyncTrigger::Manual).await?;
            println!(
                "weekly rollup complete: run_id={} status={} rows={}",
                run.id,
                run.status.as_str(),
                run.counts.aggregates_created
            );
        }
        Commands::Prune => {
            let run = vegops_sync::run_prune_from_env(SyncTrigger::Manual).await?;
            println!(
                "prune complete: run_id={} removed={}",
                run.id, run.counts.processed
            );
        }
        Commands::Migrate => {
            vegops_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = vegops_sync::PipelineConfig::from_env();
            match vegops_sync::maybe_build_scheduler(&config).await? {
                Some(mut scheduler) => {
                    scheduler.start().await?;
                    println!(
                        "scheduler running (every {}h); press ctrl-c to stop",
                        config.sync_interval_hours
                    );
                    tokio::signal::ctrl_c().await?;
                    scheduler.shutdown().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set VEGOPS_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
