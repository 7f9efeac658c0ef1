use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use kiwatch_storage::HttpClientConfig;
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

use crate::identity::UrlIdentityCache;
use crate::notify::{LogNotifier, Notifier, SendGridConfig, SendGridNotifier, DEFAULT_SUBJECT};
use crate::scheduler::{SweepOptions, SweepSettings};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    /// UTC offset the cron expression is evaluated in.
    pub sweep_timezone: FixedOffset,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub storage_timeout_secs: u64,
    pub sweep_concurrency: usize,
    pub deep_scrape: bool,
    pub alert_recipients: Vec<String>,
    pub alert_subject: String,
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_from_email: Option<String>,
    pub web_port: u16,
    pub targets_file: PathBuf,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// `UTC`, `Z` or an offset such as `-07:00`.
fn parse_offset(value: &str) -> Option<FixedOffset> {
    match value.trim() {
        "UTC" | "utc" | "Z" => Some(utc_offset()),
        other => match other.parse() {
            Ok(offset) => Some(offset),
            Err(_) => {
                warn!(value = other, "unrecognized KIWATCH_TIMEZONE; using UTC");
                None
            }
        },
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; missing or unparseable values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://kiwatch.db?mode=rwc".to_string()),
            scheduler_enabled: lookup("KIWATCH_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            sweep_cron: non_empty("KIWATCH_SWEEP_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sweep_timezone: non_empty("KIWATCH_TIMEZONE")
                .and_then(|v| parse_offset(&v))
                .unwrap_or_else(utc_offset),
            user_agent: non_empty("KIWATCH_USER_AGENT")
                .unwrap_or_else(|| "kiwatch-bot/0.1".to_string()),
            http_timeout_secs: lookup("KIWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            storage_timeout_secs: lookup("KIWATCH_STORAGE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            sweep_concurrency: lookup("KIWATCH_SWEEP_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
            deep_scrape: lookup("KIWATCH_DEEP_SCRAPE")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            alert_recipients: lookup("KIWATCH_ALERT_RECIPIENTS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            alert_subject: non_empty("KIWATCH_ALERT_SUBJECT")
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            sendgrid_api_key: non_empty("SENDGRID_API_KEY"),
            sendgrid_from_email: non_empty("SENDGRID_FROM_EMAIL"),
            web_port: lookup("KIWATCH_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            targets_file: non_empty("KIWATCH_TARGETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("targets.yaml")),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            concurrency: self.sweep_concurrency,
            // The extractor's own HTTP timeout fires first; this bounds parsing too.
            fetch_timeout: Duration::from_secs(self.http_timeout_secs + 5),
            storage_timeout: Duration::from_secs(self.storage_timeout_secs),
            recipients: self.alert_recipients.clone(),
            default_options: SweepOptions {
                deep_scrape: self.deep_scrape,
            },
        }
    }

    /// SendGrid when both key and sender are set, otherwise a log-only notifier.
    pub fn build_notifier(&self) -> Result<Arc<dyn Notifier>> {
        match (&self.sendgrid_api_key, &self.sendgrid_from_email) {
            (Some(key), Some(from)) => {
                let mut config = SendGridConfig::new(key.clone(), from.clone());
                config.subject = self.alert_subject.clone();
                config.timeout = Duration::from_secs(self.http_timeout_secs);
                let notifier =
                    SendGridNotifier::new(config).context("building sendgrid client")?;
                Ok(Arc::new(notifier))
            }
            (Some(_), None) => {
                warn!("SENDGRID_API_KEY set without SENDGRID_FROM_EMAIL; alerts will only be logged");
                Ok(Arc::new(LogNotifier))
            }
            _ => Ok(Arc::new(LogNotifier)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSeed {
    pub url: String,
}

/// Bulk registration file: `targets: [{ url: ... }]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSeedFile {
    #[serde(default)]
    pub targets: Vec<TargetSeed>,
}

impl TargetSeedFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.url.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub registered: usize,
    pub rejected: Vec<String>,
}

/// Register every seed URL through the identity cache. Re-running is a no-op.
pub async fn seed_targets(cache: &UrlIdentityCache, seeds: &TargetSeedFile) -> SeedReport {
    let mut report = SeedReport::default();
    for url in seeds.urls() {
        match cache.ensure(url).await {
            Ok(_) => report.registered += 1,
            Err(err) => {
                warn!(url, error = %err, "seed target rejected");
                report.rejected.push(url.to_string());
            }
        }
    }
    info!(
        registered = report.registered,
        rejected = report.rejected.len(),
        "targets seeded"
    );
    report
}
