//! Change detection and sweep orchestration.
//!
//! A sweep walks every registered target, extracts its known-issues rows,
//! fingerprints them, persists only rows never seen for that target and sends
//! one consolidated alert for everything new.

mod alerts;
mod config;
mod detector;
mod identity;
mod notify;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use kiwatch_adapters::KnownIssuesExtractor;
use kiwatch_storage::{HttpFetcher, Store};

pub use alerts::{AlertAggregator, AlertDigest, TargetAlerts};
pub use config::{seed_targets, SeedReport, SyncConfig, TargetSeed, TargetSeedFile};
pub use detector::{ChangeDetector, DetectionOutcome};
pub use identity::{canonical_url, RegistryError, UrlIdentityCache};
pub use notify::{
    product_title_from_url, render_email_html, LogNotifier, NotificationError, Notifier,
    SendGridConfig, SendGridNotifier, DEFAULT_SUBJECT, SENDGRID_ENDPOINT,
};
pub use scheduler::{
    PipelineError, Stage, SweepError, SweepOptions, SweepPhase, SweepScheduler, SweepSettings,
    SweepStatus, SweepSummary, TargetFailure,
};

pub const CRATE_NAME: &str = "kiwatch-sync";

/// Connect storage and wire the live extractor and notifier into a scheduler.
pub async fn build_scheduler(config: &SyncConfig) -> Result<SweepScheduler> {
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let identity = UrlIdentityCache::load(store.clone())
        .await
        .context("loading url identity cache")?;
    let http = HttpFetcher::new(config.http_config()).context("building http client")?;
    let extractor = KnownIssuesExtractor::new(Arc::new(http));
    let notifier = config.build_notifier()?;

    Ok(SweepScheduler::new(
        store,
        Arc::new(identity),
        Arc::new(extractor),
        notifier,
        config.sweep_settings(),
    ))
}

pub async fn run_sweep_once_from_env() -> Result<SweepSummary> {
    let config = SyncConfig::from_env();
    let scheduler = build_scheduler(&config).await?;
    let summary = scheduler
        .run_sweep(config.sweep_settings().default_options)
        .await?;
    Ok(summary)
}
