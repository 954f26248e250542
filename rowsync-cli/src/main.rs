//! Rowsync: keep a local record store reconciled with a tabular source.
//!
//! # Usage
//!
//! ```text
//! rowsync init [--source PATH] [--key COLUMN] [--force]
//! rowsync sync [--force] [--threshold MINUTES] [--json]
//! rowsync diff [--json]
//! rowsync status [--json]
//! rowsync metrics [--json]
//! rowsync daemon start|stop|status|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, diff::DiffArgs, init::InitArgs, metrics::MetricsArgs,
    status::StatusArgs, sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "rowsync",
    version,
    about = "Reconcile a local record store with an external tabular source",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.rowsync/config.yaml.
    Init(InitArgs),

    /// Run one sync now if the cached snapshot is stale.
    Sync(SyncArgs),

    /// Show what the next sync would change, without writing.
    Diff(DiffArgs),

    /// Show sync health, freshness and recent runs.
    Status(StatusArgs),

    /// Print sync metrics in Prometheus text format.
    Metrics(MetricsArgs),

    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // The daemon installs its own subscriber from config.yaml.
    if !matches!(cli.command, Commands::Daemon { .. }) {
        commands::init_cli_tracing();
    }
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Metrics(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
