//! `rowsync metrics`: the recorder's Prometheus text or its JSON summary.

use anyhow::{Context, Result};
use clap::Args;

use rowsync_core::paths;
use rowsync_daemon::{request_metrics, DaemonError};
use rowsync_sync::MetricsRecorder;

#[derive(Args, Debug)]
pub struct MetricsArgs {
    /// Print the summary as JSON instead of Prometheus text.
    #[arg(long)]
    pub json: bool,
}

impl MetricsArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;

        if !self.json {
            // Ask the daemon first so a remote caller sees what it exports.
            match request_metrics(&home) {
                Ok(text) => {
                    print!("{text}");
                    return Ok(());
                }
                Err(DaemonError::DaemonNotRunning { .. }) => {}
                Err(err) => tracing::warn!(error = %err, "daemon metrics unavailable, reading from disk"),
            }
        }

        let recorder = MetricsRecorder::open(paths::metrics_path(&home))
            .context("failed to load metrics")?;
        if self.json {
            let summary = super::block_on(recorder.summary())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary)
                    .context("failed to serialize metrics summary")?
            );
        } else {
            print!("{}", super::block_on(recorder.render_prometheus())?);
        }
        Ok(())
    }
}
