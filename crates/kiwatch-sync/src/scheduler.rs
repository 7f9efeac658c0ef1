//! [`SweepScheduler`]: drives fetch, detect, aggregate and notify over every target.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use kiwatch_adapters::{ExtractError, ExtractOptions, PageExtractor};
use kiwatch_core::{prepare_batch, CoreError, Observation, RawExtract, Target};
use kiwatch_storage::{Store, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerts::AlertAggregator;
use crate::detector::ChangeDetector;
use crate::identity::{RegistryError, UrlIdentityCache};
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Detect,
}

/// A failure confined to one target's pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] ExtractError),
    #[error("normalization failed: {0}")]
    Normalize(#[from] CoreError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("{stage:?} stage timed out")]
    Timeout { stage: Stage },
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Fetch(_) | PipelineError::Normalize(_) => Some(Stage::Fetch),
            PipelineError::Storage(_) => Some(Stage::Detect),
            PipelineError::Timeout { stage } => Some(*stage),
            PipelineError::Cancelled => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    Busy,
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("storage query timed out")]
    Timeout,
    #[error("target {target_id} failed: {source}")]
    Target {
        target_id: i64,
        source: PipelineError,
    },
    #[error("storage became unavailable during sweep {}", .summary.run_id)]
    StorageUnavailable { summary: Box<SweepSummary> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepOptions {
    #[serde(default)]
    pub deep_scrape: bool,
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// Targets processed at once within one sweep.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub storage_timeout: Duration,
    pub recipients: Vec<String>,
    pub default_options: SweepOptions,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fetch_timeout: Duration::from_secs(25),
            storage_timeout: Duration::from_secs(30),
            recipients: Vec::new(),
            default_options: SweepOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target_id: Option<i64>,
    pub url: Option<String>,
    pub stage: Option<Stage>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deep_scrape: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new_observations: usize,
    pub alerted_targets: usize,
    pub notified: bool,
    pub cancelled: bool,
    pub failures: Vec<TargetFailure>,
}

impl SweepSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, options: SweepOptions) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            deep_scrape: options.deep_scrape,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            new_observations: 0,
            alerted_targets: 0,
            notified: false,
            cancelled: false,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SweepPhase {
    Idle,
    /// Per-target stage of every target currently in flight.
    Sweeping {
        run_id: Uuid,
        active: BTreeMap<i64, Stage>,
    },
    Aggregating {
        run_id: Uuid,
    },
    Notifying {
        run_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepStatus {
    pub phase: SweepPhase,
    pub last_summary: Option<SweepSummary>,
}

struct Inner {
    store: Store,
    identity: Arc<UrlIdentityCache>,
    detector: ChangeDetector,
    extractor: Arc<dyn PageExtractor>,
    notifier: Arc<dyn Notifier>,
    settings: SweepSettings,
    sweep_lock: Arc<Mutex<()>>,
    status: watch::Sender<SweepStatus>,
    shutdown: CancellationToken,
    cron: Mutex<Option<JobScheduler>>,
}

/// Owns the sweep lifecycle. Cloning shares the same scheduler.
#[derive(Clone)]
pub struct SweepScheduler {
    inner: Arc<Inner>,
}

impl SweepScheduler {
    pub fn new(
        store: Store,
        identity: Arc<UrlIdentityCache>,
        extractor: Arc<dyn PageExtractor>,
        notifier: Arc<dyn Notifier>,
        settings: SweepSettings,
    ) -> Self {
        let (status, _) = watch::channel(SweepStatus {
            phase: SweepPhase::Idle,
            last_summary: None,
        });
        Self {
            inner: Arc::new(Inner {
                detector: ChangeDetector::new(store.clone()),
                store,
                identity,
                extractor,
                notifier,
                settings,
                sweep_lock: Arc::new(Mutex::new(())),
                status,
                shutdown: CancellationToken::new(),
                cron: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn identity(&self) -> &UrlIdentityCache {
        &self.inner.identity
    }

    pub fn default_options(&self) -> SweepOptions {
        self.inner.settings.default_options
    }

    /// Register a target through the identity cache.
    pub async fn register(&self, url: &str) -> Result<Target, RegistryError> {
        self.inner.identity.ensure(url).await
    }

    pub fn status(&self) -> SweepStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SweepStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.sweep_lock.try_lock().is_err()
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<()>, SweepError> {
        self.inner
            .sweep_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SweepError::Busy)
    }

    /// Run one sweep to completion, or fail fast with [`SweepError::Busy`].
    pub async fn run_sweep(&self, options: SweepOptions) -> Result<SweepSummary, SweepError> {
        let guard = self.acquire()?;
        self.run_locked(Uuid::new_v4(), options, guard).await
    }

    /// Start a sweep in the background and return its run id.
    pub fn trigger(&self, options: SweepOptions) -> Result<Uuid, SweepError> {
        let guard = self.acquire()?;
        let run_id = Uuid::new_v4();
        let this = self.clone();
        tokio::spawn(async move {
            match this.run_locked(run_id, options, guard).await {
                Ok(_) => {}
                Err(err) => error!(%run_id, error = %err, "background sweep failed"),
            }
        });
        Ok(run_id)
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        options: SweepOptions,
        _guard: OwnedMutexGuard<()>,
    ) -> Result<SweepSummary, SweepError> {
        let span = info_span!("sweep", %run_id, deep = options.deep_scrape);
        let result = self.sweep(run_id, options).instrument(span).await;

        let last_summary = match &result {
            Ok(summary) => Some(summary.clone()),
            Err(SweepError::StorageUnavailable { summary }) => Some((**summary).clone()),
            Err(_) => None,
        };
        self.inner.status.send_modify(|status| {
            status.phase = SweepPhase::Idle;
            if last_summary.is_some() {
                status.last_summary = last_summary;
            }
        });
        result
    }

    fn set_phase(&self, phase: SweepPhase) {
        self.inner.status.send_modify(|status| status.phase = phase);
    }

    fn set_stage(&self, target_id: i64, stage: Option<Stage>) {
        self.inner.status.send_modify(|status| {
            if let SweepPhase::Sweeping { active, .. } = &mut status.phase {
                match stage {
                    Some(stage) => {
                        active.insert(target_id, stage);
                    }
                    None => {
                        active.remove(&target_id);
                    }
                }
            }
        });
    }

    /// Run fetch and detect for a single target outside a full sweep.
    ///
    /// Takes the same lock as a full sweep, so it is rejected while one runs.
    /// The new observations go back to the caller; nothing is notified.
    pub async fn sweep_target(
        &self,
        target_id: i64,
        options: SweepOptions,
    ) -> Result<Vec<Observation>, SweepError> {
        let _guard = self.acquire()?;
        let target = timeout(
            self.inner.settings.storage_timeout,
            self.inner.store.target(target_id),
        )
        .await
        .map_err(|_| SweepError::Timeout)??;

        let run_id = Uuid::new_v4();
        self.set_phase(SweepPhase::Sweeping {
            run_id,
            active: BTreeMap::new(),
        });
        let span = info_span!("target", %run_id, target_id, url = %target.url);
        let result = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(PipelineError::Cancelled),
            result = self
                .process_target(&target, options, Utc::now())
                .instrument(span) => result,
        };
        self.set_phase(SweepPhase::Idle);
        result.map_err(|source| SweepError::Target { target_id, source })
    }

    /// Fetch and extract `url` without touching storage.
    pub async fn preview(
        &self,
        url: &str,
        options: SweepOptions,
    ) -> Result<RawExtract, PipelineError> {
        let extract_options = ExtractOptions {
            deep: options.deep_scrape,
        };
        let extract = timeout(
            self.inner.settings.fetch_timeout,
            self.inner.extractor.extract(url, extract_options),
        )
        .await
        .map_err(|_| PipelineError::Timeout {
            stage: Stage::Fetch,
        })??;
        Ok(extract)
    }

    async fn sweep(&self, run_id: Uuid, options: SweepOptions) -> Result<SweepSummary, SweepError> {
        let settings = &self.inner.settings;
        let started_at = Utc::now();
        let cancel = self.inner.shutdown.child_token();
        let mut summary = SweepSummary::new(run_id, started_at, options);

        let targets = timeout(settings.storage_timeout, self.inner.store.all_targets())
            .await
            .map_err(|_| SweepError::Timeout)??;
        summary.attempted = targets.len();
        info!(targets = targets.len(), "sweep started");

        self.set_phase(SweepPhase::Sweeping {
            run_id,
            active: BTreeMap::new(),
        });

        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for target in targets {
            let this = self.clone();
            let cancel = cancel.clone();
            let permits = permits.clone();
            let span = info_span!("target", target_id = target.id, url = %target.url);
            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                        result = this.process_target(&target, options, started_at) => result,
                    };
                    this.set_stage(target.id, None);
                    (target, result)
                }
                .instrument(span),
            );
        }

        let mut aggregator = AlertAggregator::new();
        let mut storage_failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Ok(new_observations))) => {
                    summary.succeeded += 1;
                    summary.new_observations += new_observations.len();
                    aggregator.record(&target, new_observations);
                }
                Ok((target, Err(err))) => {
                    if matches!(err, PipelineError::Storage(ref e) if e.is_unavailable()) {
                        storage_failures += 1;
                    }
                    if !matches!(err, PipelineError::Cancelled) {
                        warn!(
                            target_id = target.id,
                            url = %target.url,
                            error = %err,
                            "target failed"
                        );
                    }
                    summary.failed += 1;
                    summary.failures.push(TargetFailure {
                        target_id: Some(target.id),
                        url: Some(target.url),
                        stage: err.stage(),
                        error: err.to_string(),
                    });
                }
                Err(join_err) => {
                    error!(error = %join_err, "target task aborted");
                    summary.failed += 1;
                    summary.failures.push(TargetFailure {
                        target_id: None,
                        url: None,
                        stage: None,
                        error: join_err.to_string(),
                    });
                }
            }
        }
        summary.cancelled = cancel.is_cancelled();

        self.set_phase(SweepPhase::Aggregating { run_id });
        let digest = aggregator.drain();
        summary.alerted_targets = digest.len();

        if digest.is_empty() {
            debug!("no new observations; notification suppressed");
        } else if summary.cancelled {
            warn!(
                observations = digest.observation_count(),
                "sweep cancelled; notification skipped"
            );
        } else {
            self.set_phase(SweepPhase::Notifying { run_id });
            match self
                .inner
                .notifier
                .notify(&digest, &settings.recipients)
                .await
            {
                Ok(()) => summary.notified = true,
                Err(err) => error!(error = %err, "notification failed"),
            }
        }

        summary.finished_at = Utc::now();
        if summary.failed > 0 && (storage_failures > 0 || !self.storage_reachable().await) {
            error!(
                failed = summary.failed,
                succeeded = summary.succeeded,
                "storage unavailable; sweep failed"
            );
            return Err(SweepError::StorageUnavailable {
                summary: Box::new(summary),
            });
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            new_observations = summary.new_observations,
            notified = summary.notified,
            cancelled = summary.cancelled,
            "sweep finished"
        );
        Ok(summary)
    }

    async fn storage_reachable(&self) -> bool {
        matches!(
            timeout(self.inner.settings.storage_timeout, self.inner.store.ping()).await,
            Ok(Ok(()))
        )
    }

    /// Fetch, normalize and detect one target. Each step is bounded by a timeout;
    /// a detect timeout drops the open transaction, which rolls it back.
    async fn process_target(
        &self,
        target: &Target,
        options: SweepOptions,
        swept_at: DateTime<Utc>,
    ) -> Result<Vec<Observation>, PipelineError> {
        let settings = &self.inner.settings;

        self.set_stage(target.id, Some(Stage::Fetch));
        let extract = self.preview(&target.url, options).await?;
        let rows = prepare_batch(&extract)?;

        self.set_stage(target.id, Some(Stage::Detect));
        let outcome = timeout(
            settings.storage_timeout,
            self.inner.detector.detect(target, rows, swept_at),
        )
        .await
        .map_err(|_| PipelineError::Timeout {
            stage: Stage::Detect,
        })??;

        info!(
            new = outcome.new_observations.len(),
            duplicates = outcome.duplicates,
            "target swept"
        );
        Ok(outcome.new_observations)
    }

    /// Schedule recurring sweeps with a six-field cron expression evaluated at
    /// the given UTC offset.
    pub async fn start_cron(&self, cron: &str, timezone: FixedOffset) -> anyhow::Result<()> {
        let mut slot = self.inner.cron.lock().await;
        if slot.is_some() {
            anyhow::bail!("sweep schedule already started");
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = self.clone();
        let job = Job::new_async_tz(cron, timezone, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                match this.run_sweep(this.default_options()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        new_observations = summary.new_observations,
                        "scheduled sweep complete"
                    ),
                    Err(SweepError::Busy) => {
                        warn!("scheduled sweep skipped; another sweep is running")
                    }
                    Err(err) => error!(error = %err, "scheduled sweep failed"),
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {cron}"))?;
        sched.add(job).await.context("adding sweep job")?;
        sched.start().await.context("starting scheduler")?;
        info!(cron, %timezone, "sweep schedule started");
        *slot = Some(sched);
        Ok(())
    }

    /// Cancel any in-flight sweep and stop the recurring schedule.
    ///
    /// Targets still in flight are dropped mid-pass, so their transactions roll
    /// back. The scheduler does not accept new sweeps afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(mut sched) = self.inner.cron.lock().await.take() {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "stopping sweep schedule failed");
            }
        }
        // Wait for the in-flight sweep, if any, to release the lock.
        let _idle = self.inner.sweep_lock.lock().await;
        info!("sweep scheduler stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
