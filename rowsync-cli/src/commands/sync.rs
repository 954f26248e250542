//! `rowsync sync`: one in-process freshness check and, if stale, a sync run.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use rowsync_sync::{pipeline, AutoSyncResult};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Sync even if the cached snapshot is fresh.
    #[arg(long)]
    pub force: bool,

    /// Staleness threshold in minutes (defaults to `stale_after_minutes`).
    #[arg(long, value_name = "MINUTES", conflicts_with = "force")]
    pub threshold: Option<u64>,

    /// Emit the result as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let (_, orchestrator) =
            pipeline::load_and_build_at(&home).context("failed to set up sync pipeline")?;

        let result = super::block_on(async {
            if self.force {
                orchestrator.force_sync().await
            } else {
                let threshold = self
                    .threshold
                    .unwrap_or(orchestrator.settings().stale_after_minutes);
                orchestrator.sync_if_stale(threshold).await
            }
        })?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("failed to serialize result")?
            );
        } else {
            print_result(&result);
        }

        if !result.success {
            bail!(
                "sync did not complete: {}",
                result.error.as_deref().unwrap_or("some records failed")
            );
        }
        Ok(())
    }
}

fn print_result(result: &AutoSyncResult) {
    if !result.triggered && result.freshness_status.is_stale {
        println!("{} another sync is in flight, trigger dropped", "·".bright_black());
        return;
    }
    if !result.triggered {
        let age = result.freshness_status.age_in_minutes;
        println!(
            "{} snapshot is fresh ({age:.1} min old), nothing to do",
            "·".bright_black()
        );
        return;
    }

    let marker = match (result.success, result.errors.is_empty()) {
        (true, true) => "✓".green(),
        (true, false) | (false, false) => "!".yellow(),
        (false, true) => "✗".red(),
    };
    println!(
        "{marker} sync ({}): {} added, {} updated, {} deleted in {} ms",
        result.reason,
        result.records_added,
        result.records_updated,
        result.records_deleted,
        result.duration_ms,
    );
    for failure in &result.errors {
        println!(
            "  {} {} [{}] {}",
            "✗".red(),
            failure.record_key,
            failure.error_type,
            failure.message
        );
    }
    if let Some(error) = &result.error {
        println!("  {}", error.red());
    }
}
