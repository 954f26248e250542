//! Raw sync metrics and Prometheus text export.
//!
//! Every finished run appends one point per series (success rate, duration,
//! throughput) and bumps the per-type error counters. Response-time
//! percentiles are derived from the retained duration points. A persisted
//! recorder reloads its file before every update and query, so the CLI and
//! the daemon share one set of series.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use rowsync_core::{ErrorType, SyncStatus};

use crate::clock::{self, Clock};
use crate::error::SyncError;
use crate::persist;

pub const SUCCESS_RATE: &str = "rowsync_sync_success_rate";
pub const DURATION_MS: &str = "rowsync_sync_duration_ms";
pub const THROUGHPUT: &str = "rowsync_sync_throughput_records_per_second";

/// Points kept per recorder before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 3_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// What one finished run contributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSample {
    pub status: Option<SyncStatus>,
    pub duration_ms: u64,
    pub records_processed: usize,
    pub records_succeeded: usize,
    pub errors_by_type: BTreeMap<ErrorType, u64>,
}

impl RunSample {
    fn success_rate(&self) -> f64 {
        match self.status {
            Some(SyncStatus::Failed) => 0.0,
            _ if self.records_processed == 0 => 1.0,
            _ => self.records_succeeded as f64 / self.records_processed as f64,
        }
    }

    fn throughput(&self) -> f64 {
        if self.duration_ms == 0 {
            return self.records_processed as f64;
        }
        self.records_processed as f64 * 1_000.0 / self.duration_ms as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub syncs_total: u64,
    pub syncs_failed: u64,
    pub success_rate: f64,
    pub last_duration_ms: Option<f64>,
    pub last_throughput: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub errors_by_type: BTreeMap<ErrorType, u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetricsState {
    #[serde(default)]
    points: VecDeque<MetricPoint>,
    #[serde(default)]
    syncs_total: u64,
    #[serde(default)]
    syncs_failed: u64,
    #[serde(default)]
    errors_by_type: BTreeMap<ErrorType, u64>,
}

pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
    path: Option<PathBuf>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl MetricsRecorder {
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(clock::system())
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
            path: None,
            capacity: DEFAULT_CAPACITY,
            clock,
        }
    }

    /// Recorder persisted at `path`, loading existing series.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let state = persist::load_json::<MetricsState>(&path)?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            capacity: DEFAULT_CAPACITY,
            clock: clock::system(),
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(3);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock the state, refreshed from disk when persisted. An unreadable file
    /// keeps the last good copy.
    async fn refreshed(&self) -> MutexGuard<'_, MetricsState> {
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            match persist::load_json_off_thread::<MetricsState>(path.clone()).await {
                Ok(Some(fresh)) => *state = fresh,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to refresh metrics")
                }
            }
        }
        state
    }

    pub async fn record_run(&self, sample: &RunSample) -> Result<(), SyncError> {
        let timestamp = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            *state = persist::load_json_off_thread::<MetricsState>(path.clone())
                .await?
                .unwrap_or_default();
        }

        for (name, value) in [
            (SUCCESS_RATE, sample.success_rate()),
            (DURATION_MS, sample.duration_ms as f64),
            (THROUGHPUT, sample.throughput()),
        ] {
            state.points.push_back(MetricPoint {
                timestamp,
                name: name.to_string(),
                value,
                labels: BTreeMap::new(),
            });
        }
        while state.points.len() > self.capacity {
            state.points.pop_front();
        }

        state.syncs_total += 1;
        if sample.status == Some(SyncStatus::Failed) {
            state.syncs_failed += 1;
        }
        for (error_type, count) in &sample.errors_by_type {
            *state.errors_by_type.entry(*error_type).or_default() += count;
        }

        match &self.path {
            Some(path) => persist::save_json_off_thread(path.clone(), &*state).await,
            None => Ok(()),
        }
    }

    /// Retained points of one series, oldest first.
    pub async fn series(&self, name: &str) -> Vec<MetricPoint> {
        self.refreshed()
            .await
            .points
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> MetricsSummary {
        let state = self.refreshed().await;
        let values = |name: &str| -> Vec<f64> {
            state
                .points
                .iter()
                .filter(|p| p.name == name)
                .map(|p| p.value)
                .collect()
        };

        let rates = values(SUCCESS_RATE);
        let mut durations = values(DURATION_MS);
        let throughput = values(THROUGHPUT);
        let last_duration_ms = durations.last().copied();
        durations.sort_by(f64::total_cmp);

        let mut errors_by_type: BTreeMap<ErrorType, u64> =
            ErrorType::ALL.into_iter().map(|t| (t, 0)).collect();
        errors_by_type.extend(state.errors_by_type.iter().map(|(t, n)| (*t, *n)));

        MetricsSummary {
            syncs_total: state.syncs_total,
            syncs_failed: state.syncs_failed,
            success_rate: if rates.is_empty() {
                1.0
            } else {
                rates.iter().sum::<f64>() / rates.len() as f64
            },
            last_duration_ms,
            last_throughput: throughput.last().copied(),
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            errors_by_type,
        }
    }

    /// Prometheus text exposition: one gauge per scalar, one counter line per
    /// error type.
    pub async fn render_prometheus(&self) -> String {
        let summary = self.summary().await;
        let mut out = String::new();

        gauge(
            &mut out,
            SUCCESS_RATE,
            "Mean per-run fraction of records applied",
            Some(summary.success_rate),
        );
        gauge(
            &mut out,
            DURATION_MS,
            "Duration of the most recent sync run in milliseconds",
            summary.last_duration_ms,
        );
        gauge(
            &mut out,
            THROUGHPUT,
            "Records processed per second by the most recent run",
            summary.last_throughput,
        );
        for (suffix, value) in [
            ("p50", summary.p50_ms),
            ("p95", summary.p95_ms),
            ("p99", summary.p99_ms),
        ] {
            gauge(
                &mut out,
                &format!("rowsync_sync_duration_{suffix}_ms"),
                &format!("{suffix} sync duration in milliseconds"),
                value,
            );
        }

        counter_header(&mut out, "rowsync_syncs_total", "Sync runs recorded");
        let _ = writeln!(out, "rowsync_syncs_total {}", summary.syncs_total);
        counter_header(&mut out, "rowsync_syncs_failed_total", "Sync runs that failed");
        let _ = writeln!(out, "rowsync_syncs_failed_total {}", summary.syncs_failed);

        counter_header(
            &mut out,
            "rowsync_sync_errors_total",
            "Terminal record failures by error type",
        );
        for (error_type, count) in &summary.errors_by_type {
            let _ = writeln!(
                out,
                "rowsync_sync_errors_total{{type=\"{error_type}\"}} {count}"
            );
        }
        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: Option<f64>) {
    let Some(value) = value else {
        return;
    };
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}
