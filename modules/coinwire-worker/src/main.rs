use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use coinwire_common::{load_config, AppConfig, FileConfig};
use coinwire_narratives::{
    backfill_fingerprints, migrate, DuplicateConsolidator, LifecycleSweeper, NarrativeDetector,
    PgArticleSource, PgNarrativeStore,
};

#[derive(Parser)]
#[command(name = "coinwire-worker")]
#[command(about = "Narrative detection and lifecycle worker")]
#[command(version)]
struct Cli {
    /// TOML tuning file. Overrides COINWIRE_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run detection and the lifecycle sweep on their intervals until interrupted
    Run,

    /// Run one detection pass
    Detect {
        /// Lookback window in hours (defaults to schedule.lookback_hours)
        #[arg(long)]
        lookback_hours: Option<i64>,
    },

    /// Run one lifecycle sweep
    Sweep,

    /// Consolidate duplicate narratives
    Dedup,

    /// Repair narratives stored without a fingerprint or nucleus entity
    Backfill,

    /// Apply the narrative schema and exit
    Migrate,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("coinwire=info".parse()?);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let app = AppConfig::from_env()?;
    init_tracing(app.log_json)?;

    info!("Coinwire worker starting...");
    app.log_redacted();

    let config = match &cli.config {
        Some(path) => {
            let config = load_config(path)?;
            config.validate()?;
            config
        }
        None => app.file_config()?,
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&app.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    migrate(&pool).await.context("Narrative schema migration failed")?;

    let store = Arc::new(PgNarrativeStore::new(pool.clone()));
    let articles = Arc::new(PgArticleSource::new(pool));

    match cli.command {
        Command::Migrate => {}
        Command::Detect { lookback_hours } => {
            let hours = lookback_hours.unwrap_or(config.schedule.lookback_hours);
            let detector = NarrativeDetector::new(store, articles, &config);
            detector.run_detection(chrono::Duration::hours(hours)).await?;
        }
        Command::Sweep => {
            LifecycleSweeper::new(store, &config).run_lifecycle_sweep().await?;
        }
        Command::Dedup => {
            DuplicateConsolidator::new(store, &config).consolidate_duplicates().await?;
        }
        Command::Backfill => {
            backfill_fingerprints(&*store, &config.matching).await?;
        }
        Command::Run => run_loops(store, articles, &config).await,
    }

    Ok(())
}

/// Detection and sweep on independent intervals. A failed run is logged and
/// retried on the next tick.
async fn run_loops(store: Arc<PgNarrativeStore>, articles: Arc<PgArticleSource>, config: &FileConfig) {
    let schedule = &config.schedule;
    let lookback = chrono::Duration::hours(schedule.lookback_hours);

    let detector = NarrativeDetector::new(store.clone(), articles, config);
    let sweeper = LifecycleSweeper::new(store.clone(), config);
    let consolidator = DuplicateConsolidator::new(store, config);

    let mut detect_tick = tokio::time::interval(StdDuration::from_secs(schedule.detection_interval_minutes * 60));
    let mut sweep_tick = tokio::time::interval(StdDuration::from_secs(schedule.sweep_interval_minutes * 60));
    detect_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        detection_interval_minutes = schedule.detection_interval_minutes,
        sweep_interval_minutes = schedule.sweep_interval_minutes,
        lookback_hours = schedule.lookback_hours,
        "Starting detection and sweep loops"
    );

    loop {
        tokio::select! {
            _ = detect_tick.tick() => {
                if let Err(e) = detector.run_detection(lookback).await {
                    error!(error = %e, "Detection run failed, retrying next tick");
                }
            }
            _ = sweep_tick.tick() => {
                if let Err(e) = sweeper.run_lifecycle_sweep().await {
                    error!(error = %e, "Lifecycle sweep failed, retrying next tick");
                    continue;
                }
                if schedule.consolidate_after_sweep {
                    if let Err(e) = consolidator.consolidate_duplicates().await {
                        error!(error = %e, "Duplicate consolidation failed, retrying next tick");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
}
