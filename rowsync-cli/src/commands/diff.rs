//! `rowsync diff`: fetch and diff against the current baseline, no writes.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use rowsync_sync::orchestrator::Baseline;
use rowsync_sync::{pipeline, DiffPreview};

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Emit the preview as JSON.
    #[arg(long)]
    pub json: bool,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let (_, orchestrator) =
            pipeline::load_and_build_at(&home).context("failed to set up sync pipeline")?;
        let preview = super::block_on(orchestrator.preview())?.context("diff failed")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&preview).context("failed to serialize diff")?
            );
        } else {
            print_preview(&preview);
        }
        Ok(())
    }
}

fn print_preview(preview: &DiffPreview) {
    let baseline = match preview.baseline {
        Baseline::Cache => "cached snapshot",
        Baseline::Store => "store",
    };
    println!(
        "Comparing source ({} rows) against {baseline} ({} rows)",
        preview.current_len, preview.previous_len
    );

    let diff = &preview.diff;
    if diff.is_empty() {
        println!("{} no changes", "·".bright_black());
        return;
    }
    for record in &diff.added {
        println!("{} {}", "+".green(), record.key);
    }
    for record in &diff.updated {
        println!("{} {}", "~".yellow(), record.key);
    }
    for key in &diff.deleted {
        println!("{} {}", "-".red(), key);
    }
    println!(
        "{} added, {} updated, {} deleted",
        diff.added.len(),
        diff.updated.len(),
        diff.deleted.len()
    );
}
