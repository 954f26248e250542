//! Sync run lifecycle, per-record error log, and rolling health.
//!
//! State is an in-memory table of runs plus an append-only error table,
//! optionally mirrored to `~/.rowsync/state/runs.json`. A persisted tracker
//! treats the file as the source of truth: every mutation reloads it first and
//! every query refreshes from it, so the CLI and the daemon see each other's
//! runs. Cross-process writers are serialised by the flight lease.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard};

use rowsync_core::{RecordKey, SyncErrorEntry, SyncId, SyncRecord, SyncStatus, SyncType};

use crate::batch::RecordFailure;
use crate::clock::{self, Clock};
use crate::error::{Classify, SyncError};
use crate::persist;

/// Runs kept before the oldest are pruned.
pub const MAX_RUNS: usize = 500;
/// Error rows kept before the oldest are pruned.
pub const MAX_ERRORS: usize = 5_000;
/// Window used by [`SyncStateTracker::get_health`].
pub const HEALTH_WINDOW_HOURS: u32 = 24;

/// Final counters handed to [`SyncStateTracker::complete_sync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub total_items: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub window_hours: u32,
    pub total_syncs: usize,
    pub successful_syncs: usize,
    pub failed_syncs: usize,
    pub partial_syncs: usize,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Health thresholds. `error_rate` is a fraction, `recent_errors` the number
/// of error rows in the last hour.
pub fn health_status(error_rate: f64, recent_errors: usize) -> HealthStatus {
    if error_rate > 0.10 || recent_errors > 50 {
        HealthStatus::Unhealthy
    } else if error_rate > 0.05 || recent_errors > 20 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub status: HealthStatus,
    pub error_rate: f64,
    #[serde(rename = "avgSyncDuration")]
    pub avg_sync_duration_ms: f64,
    pub recent_errors: usize,
}

/// Dashboard view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSurface {
    pub last_sync: Option<SyncRecord>,
    pub error_rate: f64,
    #[serde(rename = "avgSyncDuration")]
    pub avg_sync_duration_ms: f64,
    pub recent_errors: usize,
    pub status: HealthStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerState {
    #[serde(default)]
    runs: Vec<SyncRecord>,
    #[serde(default)]
    errors: Vec<SyncErrorEntry>,
}

impl TrackerState {
    fn run_mut(&mut self, id: SyncId) -> Result<&mut SyncRecord, SyncError> {
        self.runs
            .iter_mut()
            .rev()
            .find(|run| run.id == id)
            .ok_or(SyncError::UnknownSync(id))
    }

    fn prune(&mut self) {
        if self.runs.len() > MAX_RUNS {
            let excess = self.runs.len() - MAX_RUNS;
            self.runs.drain(..excess);
        }
        if self.errors.len() > MAX_ERRORS {
            let excess = self.errors.len() - MAX_ERRORS;
            self.errors.drain(..excess);
        }
    }
}

fn transition(run: &mut SyncRecord, to: SyncStatus) -> Result<(), SyncError> {
    if !run.status.can_transition_to(to) {
        return Err(SyncError::InvalidTransition {
            id: run.id,
            from: run.status,
            to,
        });
    }
    run.status = to;
    Ok(())
}

pub struct SyncStateTracker {
    state: RwLock<TrackerState>,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl SyncStateTracker {
    /// Tracker that forgets everything on drop.
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(clock::system())
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            path: None,
            clock,
        }
    }

    /// Tracker persisted at `path`, loading existing state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        Self::open_with_clock(path, clock::system())
    }

    pub fn open_with_clock(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let path = path.into();
        let state = persist::load_json::<TrackerState>(&path)?.unwrap_or_default();
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            clock,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reload from disk, apply `change`, prune and write back, all under the
    /// write lock.
    async fn mutate<R>(
        &self,
        change: impl FnOnce(&mut TrackerState) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let mut state = self.state.write().await;
        if let Some(path) = &self.path {
            *state = persist::load_json_off_thread::<TrackerState>(path.clone())
                .await?
                .unwrap_or_default();
        }
        let out = change(&mut state)?;
        state.prune();
        if let Some(path) = &self.path {
            persist::save_json_off_thread(path.clone(), &*state).await?;
        }
        Ok(out)
    }

    /// Current state, refreshed from disk when persisted. An unreadable file
    /// keeps the last good copy.
    async fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        let Some(path) = &self.path else {
            return self.state.read().await;
        };
        let mut state = self.state.write().await;
        match persist::load_json_off_thread::<TrackerState>(path.clone()).await {
            Ok(Some(fresh)) => *state = fresh,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to refresh run history")
            }
        }
        state.downgrade()
    }

    /// Register a new run in `queued`.
    pub async fn create_sync(
        &self,
        sync_type: SyncType,
        metadata: BTreeMap<String, Value>,
    ) -> Result<SyncId, SyncError> {
        let id = SyncId::new();
        let record = SyncRecord {
            id,
            sync_type,
            status: SyncStatus::Queued,
            started_at: self.clock.now(),
            completed_at: None,
            total_items: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            error_details: None,
            metadata,
        };
        self.mutate(|state| {
            state.runs.push(record);
            Ok(())
        })
        .await?;
        tracing::debug!(sync_id = %id, %sync_type, "sync run created");
        Ok(id)
    }

    pub async fn start_sync(&self, id: SyncId, total_items: usize) -> Result<(), SyncError> {
        self.mutate(|state| {
            let run = state.run_mut(id)?;
            transition(run, SyncStatus::InProgress)?;
            run.total_items = total_items;
            Ok(())
        })
        .await
    }

    /// Close a run; the terminal status follows from the counters.
    pub async fn complete_sync(&self, id: SyncId, stats: SyncStats) -> Result<SyncStatus, SyncError> {
        let now = self.clock.now();
        let status = SyncStatus::from_counts(stats.success_count, stats.failed_count);
        self.mutate(|state| {
            let run = state.run_mut(id)?;
            transition(run, status)?;
            run.completed_at = Some(now);
            run.total_items = stats.total_items;
            run.success_count = stats.success_count;
            run.failed_count = stats.failed_count;
            run.skipped_count = stats.skipped_count;
            run.metadata.extend(stats.metadata);
            Ok(())
        })
        .await?;
        tracing::info!(sync_id = %id, %status, "sync run finished");
        Ok(status)
    }

    /// Close a run as `failed` after a fatal error.
    pub async fn fail_sync(&self, id: SyncId, error: &str) -> Result<(), SyncError> {
        let now = self.clock.now();
        self.mutate(|state| {
            let run = state.run_mut(id)?;
            transition(run, SyncStatus::Failed)?;
            run.completed_at = Some(now);
            run.error_details = Some(error.to_string());
            Ok(())
        })
        .await?;
        tracing::error!(sync_id = %id, error, "sync run failed");
        Ok(())
    }

    /// Append an error row, classifying `error` with the shared classifier.
    pub async fn record_error<E>(
        &self,
        id: SyncId,
        record_key: RecordKey,
        error: &E,
        retry_count: u32,
    ) -> Result<SyncErrorEntry, SyncError>
    where
        E: Classify + fmt::Display + ?Sized,
    {
        let entry = SyncErrorEntry {
            sync_id: id,
            record_key,
            error_type: error.error_type(),
            message: error.to_string(),
            stack: None,
            retry_count,
            recorded_at: self.clock.now(),
        };
        self.append_errors(std::slice::from_ref(&entry)).await?;
        Ok(entry)
    }

    /// Append one row per failed record of a batch.
    pub async fn record_failures(
        &self,
        id: SyncId,
        failures: &[RecordFailure],
    ) -> Result<(), SyncError> {
        if failures.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let entries: Vec<SyncErrorEntry> = failures
            .iter()
            .map(|f| SyncErrorEntry {
                sync_id: id,
                record_key: f.record_key.clone(),
                error_type: f.error_type,
                message: f.message.clone(),
                stack: None,
                retry_count: f.retry_count,
                recorded_at: now,
            })
            .collect();
        self.append_errors(&entries).await
    }

    async fn append_errors(&self, entries: &[SyncErrorEntry]) -> Result<(), SyncError> {
        self.mutate(|state| {
            if let Some(unknown) = entries
                .iter()
                .find(|e| !state.runs.iter().any(|run| run.id == e.sync_id))
            {
                return Err(SyncError::UnknownSync(unknown.sync_id));
            }
            state.errors.extend_from_slice(entries);
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: SyncId) -> Option<SyncRecord> {
        self.read()
            .await
            .runs
            .iter()
            .find(|run| run.id == id)
            .cloned()
    }

    /// Most recently created run.
    pub async fn last_sync(&self) -> Option<SyncRecord> {
        self.read().await.runs.last().cloned()
    }

    /// Newest first.
    pub async fn recent_runs(&self, limit: usize) -> Vec<SyncRecord> {
        self.read()
            .await
            .runs
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn errors_for(&self, id: SyncId) -> Vec<SyncErrorEntry> {
        self.read()
            .await
            .errors
            .iter()
            .filter(|e| e.sync_id == id)
            .cloned()
            .collect()
    }

    /// Aggregates over terminal runs started within the last `window_hours`.
    pub async fn get_statistics(&self, window_hours: u32) -> SyncStatistics {
        let since = self.clock.now() - Duration::hours(i64::from(window_hours));
        let state = self.read().await;
        let mut stats = SyncStatistics {
            window_hours,
            ..SyncStatistics::default()
        };
        let mut total_duration_ms: i64 = 0;

        for run in state
            .runs
            .iter()
            .filter(|run| run.started_at >= since && run.status.is_terminal())
        {
            stats.total_syncs += 1;
            match run.status {
                SyncStatus::Completed => stats.successful_syncs += 1,
                SyncStatus::Failed => stats.failed_syncs += 1,
                SyncStatus::Partial => stats.partial_syncs += 1,
                SyncStatus::Queued | SyncStatus::InProgress => {}
            }
            total_duration_ms += run.duration_ms().unwrap_or(0);
        }

        if stats.total_syncs > 0 {
            stats.error_rate = stats.failed_syncs as f64 / stats.total_syncs as f64;
            stats.avg_duration_ms = total_duration_ms as f64 / stats.total_syncs as f64;
        }
        stats
    }

    /// Error rows recorded at or after `since`.
    pub async fn errors_since(&self, since: DateTime<Utc>) -> usize {
        self.read()
            .await
            .errors
            .iter()
            .filter(|e| e.recorded_at >= since)
            .count()
    }

    pub async fn get_health(&self) -> SyncHealth {
        let stats = self.get_statistics(HEALTH_WINDOW_HOURS).await;
        let recent_errors = self.errors_since(self.clock.now() - Duration::hours(1)).await;
        SyncHealth {
            status: health_status(stats.error_rate, recent_errors),
            error_rate: stats.error_rate,
            avg_sync_duration_ms: stats.avg_duration_ms,
            recent_errors,
        }
    }

    pub async fn status_surface(&self) -> StatusSurface {
        let health = self.get_health().await;
        StatusSurface {
            last_sync: self.last_sync().await,
            error_rate: health.error_rate,
            avg_sync_duration_ms: health.avg_sync_duration_ms,
            recent_errors: health.recent_errors,
            status: health.status,
        }
    }
}
