use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiwatch_storage::Store;
use kiwatch_sync::{seed_targets, SweepOptions, SyncConfig, TargetSeedFile, UrlIdentityCache};
use kiwatch_web::AppState;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kiwatch-cli")]
#[command(about = "Known-issues page change detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sweep over every registered target and exit.
    Sweep {
        /// Extract every table row instead of only the most recent one.
        #[arg(long)]
        deep_scrape: bool,
    },
    /// Register the targets listed in a seed file.
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Serve the triage API and run scheduled sweeps.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sweep { deep_scrape: false }) {
        Commands::Sweep { deep_scrape } => {
            let scheduler = kiwatch_sync::build_scheduler(&config).await?;
            let options = SweepOptions {
                deep_scrape: deep_scrape || config.deep_scrape,
            };
            let summary = scheduler.run_sweep(options).await?;
            println!(
                "sweep complete: run_id={} attempted={} succeeded={} failed={} new={} notified={}",
                summary.run_id,
                summary.attempted,
                summary.succeeded,
                summary.failed,
                summary.new_observations,
                summary.notified
            );
        }
        Commands::Seed { file } => {
            let path = file.unwrap_or_else(|| config.targets_file.clone());
            let seeds = TargetSeedFile::load(&path).await?;
            let store = Store::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            let cache = UrlIdentityCache::load(store.clone())
                .await
                .context("loading url identity cache")?;
            let report = seed_targets(&cache, &seeds).await;
            store.close().await;
            println!(
                "seed complete: registered={} rejected={} known={}",
                report.registered,
                report.rejected.len(),
                cache.len().await
            );
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            store.close().await;
            println!("schema up to date: {}", config.database_url);
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let scheduler = kiwatch_sync::build_scheduler(&config).await?;

    match scheduler.trigger(scheduler.default_options()) {
        Ok(run_id) => info!(%run_id, "initial sweep started"),
        Err(err) => warn!(error = %err, "initial sweep not started"),
    }
    if config.scheduler_enabled {
        scheduler
            .start_cron(&config.sweep_cron, config.sweep_timezone)
            .await?;
    }

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "listening for ctrl-c failed; serving until killed");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    let served =
        kiwatch_web::serve(AppState::new(scheduler.clone()), config.web_port, shutdown).await;

    scheduler.shutdown().await;
    scheduler.store().close().await;
    served
}
