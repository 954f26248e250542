//! `rowsync status`: health surface, freshness and recent runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use rowsync_core::{SyncRecord, SyncStatus};
use rowsync_daemon::{send_request, DaemonRequest};
use rowsync_sync::freshness::format_datetime_age;
use rowsync_sync::tracker::{SyncStatistics, HEALTH_WINDOW_HOURS};
use rowsync_sync::{pipeline, FreshnessStatus, HealthStatus, StatusSurface};

const RECENT_RUNS: usize = 10;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    health: StatusSurface,
    freshness: FreshnessStatus,
    statistics: SyncStatistics,
    recent_runs: Vec<SyncRecord>,
    daemon_running: bool,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "started")]
    started: String,
    #[tabled(rename = "type")]
    sync_type: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "items")]
    items: usize,
    #[tabled(rename = "failed")]
    failed: usize,
    #[tabled(rename = "duration")]
    duration: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let (_, orchestrator) =
            pipeline::load_and_build_at(&home).context("failed to set up sync pipeline")?;
        let threshold = orchestrator.settings().stale_after_minutes;

        let report = super::block_on(async {
            let tracker = orchestrator.tracker();
            Ok::<_, rowsync_sync::SyncError>(StatusReport {
                health: tracker.status_surface().await,
                freshness: orchestrator.freshness(threshold).await?,
                statistics: tracker.get_statistics(HEALTH_WINDOW_HOURS).await,
                recent_runs: tracker.recent_runs(RECENT_RUNS).await,
                daemon_running: send_request(&home, &DaemonRequest::new("status")).is_ok(),
            })
        })?
        .context("failed to read sync state")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status")?
            );
        } else {
            print_report(report);
        }
        Ok(())
    }
}

fn print_report(report: StatusReport) {
    let health = match report.health.status {
        HealthStatus::Healthy => "HEALTHY".green(),
        HealthStatus::Degraded => "DEGRADED".yellow(),
        HealthStatus::Unhealthy => "UNHEALTHY".red(),
    };
    let daemon = if report.daemon_running {
        "running".green()
    } else {
        "stopped".bright_black()
    };
    println!(
        "Rowsync v{} | {health} | daemon {daemon}",
        env!("CARGO_PKG_VERSION")
    );

    let freshness = match report.freshness.last_update_time {
        Some(at) if report.freshness.is_stale => format!("stale (updated {})", format_age(at)),
        Some(at) => format!("fresh (updated {})", format_age(at)),
        None => "no cached snapshot".to_string(),
    };
    println!("  snapshot: {freshness}");
    println!(
        "  last {}h: {} runs, error rate {:.1}%, avg {:.0} ms, {} record errors in the last hour",
        report.statistics.window_hours,
        report.statistics.total_syncs,
        report.health.error_rate * 100.0,
        report.health.avg_sync_duration_ms,
        report.health.recent_errors,
    );

    if report.recent_runs.is_empty() {
        println!("No sync runs yet. Run `rowsync sync` to start.");
        return;
    }

    let rows: Vec<RunRow> = report
        .recent_runs
        .iter()
        .map(|run| RunRow {
            started: format_age(run.started_at),
            sync_type: run.sync_type.to_string(),
            status: status_label(run.status),
            items: run.total_items,
            failed: run.failed_count,
            duration: run
                .duration_ms()
                .map(|ms| format!("{ms} ms"))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn status_label(status: SyncStatus) -> String {
    match status {
        SyncStatus::Completed => status.as_str().green().to_string(),
        SyncStatus::Partial => status.as_str().yellow().to_string(),
        SyncStatus::Failed => status.as_str().red().to_string(),
        SyncStatus::Queued | SyncStatus::InProgress => status.as_str().to_string(),
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    format!("{} ago", format_datetime_age(at))
}
