//! End-to-end sync entry point.
//!
//! One call to [`SyncOrchestrator::sync_if_stale`]:
//! 1. takes the single-flight guard, or returns a no-op if a run is active
//! 2. checks freshness of the cached snapshot
//! 3. when stale: fetch (retried), diff against the cached snapshot or the
//!    store, apply (retried), cache what landed, close the run, record
//!    metrics, and broadcast the new snapshot if anything changed
//!
//! The orchestrator never returns an error. Every failure ends up in the
//! returned [`AutoSyncResult`] and in the run's terminal status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rowsync_core::{Diff, ErrorType, RetryConfig, Snapshot, SyncConfig, SyncId, SyncStatus, SyncType};

use crate::batch::RecordFailure;
use crate::diff::{self, ApplyResult, DiffEngine};
use crate::error::{Classify, SyncError};
use crate::flight::FlightGuard;
use crate::freshness::{FreshnessGate, FreshnessStatus};
use crate::metrics::{MetricsRecorder, RunSample};
use crate::retry::RetryExecutor;
use crate::tracker::{SyncStateTracker, SyncStats};

/// Capacity of the change broadcast. Receivers further behind than this lag
/// and skip to the newest snapshot.
pub const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    StaleCache,
    NoCache,
    FreshCache,
}

impl std::fmt::Display for SyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncReason::StaleCache => "stale_cache",
            SyncReason::NoCache => "no_cache",
            SyncReason::FreshCache => "fresh_cache",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSyncResult {
    pub triggered: bool,
    pub reason: SyncReason,
    pub freshness_status: FreshnessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<SyncId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatus>,
    pub success: bool,
    pub records_added: usize,
    pub records_updated: usize,
    pub records_deleted: usize,
    pub errors: Vec<RecordFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AutoSyncResult {
    fn skipped(reason: SyncReason, freshness_status: FreshnessStatus) -> Self {
        Self {
            triggered: false,
            reason,
            freshness_status,
            sync_id: None,
            status: None,
            success: true,
            records_added: 0,
            records_updated: 0,
            records_deleted: 0,
            errors: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    fn not_started(reason: SyncReason, freshness_status: FreshnessStatus, error: &SyncError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::skipped(reason, freshness_status)
        }
    }

    pub fn has_changes(&self) -> bool {
        self.records_added + self.records_updated + self.records_deleted > 0
    }
}

/// Which snapshot a diff was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    Cache,
    Store,
}

/// Dry-run result: what the next sync would do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffPreview {
    pub baseline: Baseline,
    pub freshness_status: FreshnessStatus,
    pub previous_len: usize,
    pub current_len: usize,
    pub diff: Diff,
}

/// Tunables taken from [`SyncConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub cache_key: String,
    pub cache_ttl_seconds: u64,
    pub stale_after_minutes: u64,
    pub fetch_retry: RetryConfig,
    pub apply_retry: RetryConfig,
    pub run_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            cache_key: config.cache_key.clone(),
            cache_ttl_seconds: config.cache_ttl_seconds,
            stale_after_minutes: config.stale_after_minutes,
            fetch_retry: config.fetch_retry,
            apply_retry: config.apply_retry,
            run_timeout: config.run_timeout(),
        }
    }
}

/// Everything the orchestrator drives, injected by the caller.
pub struct Components {
    pub gate: FreshnessGate,
    pub engine: DiffEngine,
    pub executor: Arc<RetryExecutor>,
    pub tracker: Arc<SyncStateTracker>,
    pub metrics: Arc<MetricsRecorder>,
    pub flight: Arc<dyn FlightGuard>,
}

struct RunOutcome {
    result: ApplyResult,
    status: SyncStatus,
    cached: Snapshot,
}

pub struct SyncOrchestrator {
    gate: FreshnessGate,
    engine: DiffEngine,
    executor: Arc<RetryExecutor>,
    tracker: Arc<SyncStateTracker>,
    metrics: Arc<MetricsRecorder>,
    flight: Arc<dyn FlightGuard>,
    settings: OrchestratorSettings,
    events: broadcast::Sender<Arc<Snapshot>>,
}

impl SyncOrchestrator {
    pub fn new(components: Components, settings: OrchestratorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gate: components.gate,
            engine: components.engine,
            executor: components.executor,
            tracker: components.tracker,
            metrics: components.metrics,
            flight: components.flight,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<SyncStateTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn gate(&self) -> &FreshnessGate {
        &self.gate
    }

    /// Whether a run currently holds the guard.
    pub fn is_running(&self) -> bool {
        self.flight.is_held()
    }

    /// Receiver of every snapshot that changed the store.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.events.subscribe()
    }

    /// Run `callback` on its own task for every change event.
    ///
    /// A panicking callback ends its own task only.
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Snapshot>) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(snapshot) => callback(snapshot),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "change subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Freshness of the cached snapshot against `threshold_minutes`.
    pub async fn freshness(&self, threshold_minutes: u64) -> Result<FreshnessStatus, SyncError> {
        self.gate
            .check_freshness(&self.settings.cache_key, threshold_minutes)
            .await
    }

    /// Drop the cached snapshot so the next run diffs against the store.
    pub async fn invalidate(&self) -> Result<bool, SyncError> {
        self.gate.invalidate(&self.settings.cache_key).await
    }

    /// Scheduled sync using the configured threshold.
    pub async fn sync_if_stale_default(&self) -> AutoSyncResult {
        self.sync_if_stale(self.settings.stale_after_minutes).await
    }

    pub async fn sync_if_stale(&self, threshold_minutes: u64) -> AutoSyncResult {
        self.sync_if_stale_as(threshold_minutes, SyncType::Scheduled)
            .await
    }

    /// Manual sync that ignores freshness. Still subject to single-flight.
    pub async fn force_sync(&self) -> AutoSyncResult {
        self.sync_if_stale_as(0, SyncType::Manual).await
    }

    pub async fn sync_if_stale_as(
        &self,
        threshold_minutes: u64,
        sync_type: SyncType,
    ) -> AutoSyncResult {
        let started = Instant::now();

        let _permit = match self.flight.try_acquire() {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                tracing::debug!("sync already in flight, dropping trigger");
                let freshness = self
                    .freshness(threshold_minutes)
                    .await
                    .unwrap_or_else(|_| FreshnessStatus::missing());
                return AutoSyncResult::skipped(SyncReason::FreshCache, freshness);
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to acquire sync guard");
                return AutoSyncResult::not_started(
                    SyncReason::FreshCache,
                    FreshnessStatus::missing(),
                    &err,
                );
            }
        };

        let freshness = match self.freshness(threshold_minutes).await {
            Ok(freshness) => freshness,
            Err(err) => {
                tracing::error!(error = %err, "freshness check failed");
                return AutoSyncResult::not_started(
                    SyncReason::NoCache,
                    FreshnessStatus::missing(),
                    &err,
                );
            }
        };
        if !freshness.is_stale {
            tracing::debug!(age_minutes = freshness.age_in_minutes, "snapshot fresh");
            return AutoSyncResult::skipped(SyncReason::FreshCache, freshness);
        }
        let reason = if freshness.has_entry() {
            SyncReason::StaleCache
        } else {
            SyncReason::NoCache
        };

        let metadata = BTreeMap::from([
            ("reason".to_string(), json!(reason.to_string())),
            ("threshold_minutes".to_string(), json!(threshold_minutes)),
        ]);
        let id = match self.tracker.create_sync(sync_type, metadata).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "could not register sync run");
                return AutoSyncResult::not_started(reason, freshness, &err);
            }
        };
        tracing::info!(sync_id = %id, %reason, %sync_type, "sync started");

        let run_timeout = self.settings.run_timeout;
        let outcome = match tokio::time::timeout(run_timeout, self.run(id)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Timeout { after: run_timeout }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(RunOutcome {
                result,
                status,
                cached,
            }) => {
                self.record_metrics(RunSample {
                    status: Some(status),
                    duration_ms,
                    records_processed: result.total(),
                    records_succeeded: result.succeeded(),
                    errors_by_type: count_by_type(&result.errors),
                })
                .await;
                if result.has_changes() {
                    // No receivers is not an error.
                    let receivers = self.events.send(Arc::new(cached)).unwrap_or(0);
                    tracing::debug!(receivers, "change broadcast");
                }
                tracing::info!(
                    sync_id = %id,
                    %status,
                    added = result.records_added,
                    updated = result.records_updated,
                    deleted = result.records_deleted,
                    failed = result.failed(),
                    duration_ms,
                    "sync finished"
                );
                AutoSyncResult {
                    triggered: true,
                    reason,
                    freshness_status: freshness,
                    sync_id: Some(id),
                    status: Some(status),
                    success: result.success,
                    records_added: result.records_added,
                    records_updated: result.records_updated,
                    records_deleted: result.records_deleted,
                    errors: result.errors,
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(sync_id = %id, error = %message, error_type = %err.error_type(), "sync failed");
                if let Err(track_err) = self.tracker.fail_sync(id, &message).await {
                    tracing::warn!(sync_id = %id, error = %track_err, "could not close failed run");
                }
                self.record_metrics(RunSample {
                    status: Some(SyncStatus::Failed),
                    duration_ms,
                    records_processed: 0,
                    records_succeeded: 0,
                    errors_by_type: BTreeMap::from([(err.error_type(), 1)]),
                })
                .await;
                AutoSyncResult {
                    triggered: true,
                    reason,
                    freshness_status: freshness,
                    sync_id: Some(id),
                    status: Some(SyncStatus::Failed),
                    success: false,
                    records_added: 0,
                    records_updated: 0,
                    records_deleted: 0,
                    errors: Vec::new(),
                    error: Some(message),
                    duration_ms,
                }
            }
        }
    }

    async fn run(&self, id: SyncId) -> Result<RunOutcome, SyncError> {
        let key = self.settings.cache_key.as_str();
        let current = self.fetch().await?;
        let (previous, _) = self.baseline().await?;
        let changes = diff::diff(&previous, &current);
        self.tracker.start_sync(id, changes.change_count()).await?;

        let engine = &self.engine;
        let changes_ref = &changes;
        let result = self
            .executor
            .with_retry("apply diff", &self.settings.apply_retry, || {
                engine.apply(changes_ref)
            })
            .await?;
        self.tracker.record_failures(id, &result.errors).await?;

        let cached = diff::reconcile(&previous, &current, &result);
        self.gate
            .set(key, &cached, self.settings.cache_ttl_seconds)
            .await?;

        let unchanged = current
            .len()
            .saturating_sub(changes.added.len() + changes.updated.len());
        let stats = SyncStats {
            total_items: result.total(),
            success_count: result.succeeded(),
            failed_count: result.failed(),
            skipped_count: unchanged,
            metadata: BTreeMap::from([
                ("records_added".to_string(), Value::from(result.records_added)),
                ("records_updated".to_string(), Value::from(result.records_updated)),
                ("records_deleted".to_string(), Value::from(result.records_deleted)),
            ]),
        };
        let status = self.tracker.complete_sync(id, stats).await?;
        Ok(RunOutcome {
            result,
            status,
            cached,
        })
    }

    async fn fetch(&self) -> Result<Snapshot, SyncError> {
        let engine = &self.engine;
        self.executor
            .with_retry("fetch snapshot", &self.settings.fetch_retry, || {
                engine.fetch_latest_snapshot()
            })
            .await
            .map_err(SyncError::from)
    }

    /// Cached snapshot, or the store contents when nothing is cached.
    async fn baseline(&self) -> Result<(Snapshot, Baseline), SyncError> {
        if let Some(entry) = self
            .gate
            .get::<Snapshot>(&self.settings.cache_key)
            .await?
        {
            return Ok((entry.data.normalized(), Baseline::Cache));
        }
        let engine = &self.engine;
        let stored = self
            .executor
            .with_retry("load store", &self.settings.fetch_retry, || {
                engine.load_store_snapshot()
            })
            .await?;
        Ok((stored, Baseline::Store))
    }

    /// Fetch and diff without writing anything.
    pub async fn preview(&self) -> Result<DiffPreview, SyncError> {
        let freshness_status = self.freshness(self.settings.stale_after_minutes).await?;
        let current = self.fetch().await?;
        let (previous, baseline) = self.baseline().await?;
        Ok(DiffPreview {
            baseline,
            freshness_status,
            previous_len: previous.len(),
            current_len: current.len(),
            diff: diff::diff(&previous, &current),
        })
    }

    async fn record_metrics(&self, sample: RunSample) {
        if let Err(err) = self.metrics.record_run(&sample).await {
            tracing::warn!(error = %err, "failed to record metrics");
        }
    }
}

fn count_by_type(errors: &[RecordFailure]) -> BTreeMap<ErrorType, u64> {
    let mut counts = BTreeMap::new();
    for failure in errors {
        *counts.entry(failure.error_type).or_default() += 1;
    }
    counts
}
