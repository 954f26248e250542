pub mod daemon;
pub mod diff;
pub mod init;
pub mod metrics;
pub mod status;
pub mod sync;

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub(crate) fn home() -> Result<PathBuf> {
    rowsync_core::paths::home().context("could not determine home directory")
}

/// One-shot commands log warnings and errors to stderr only, so stdout stays
/// parseable. `RUST_LOG` overrides.
pub(crate) fn init_cli_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Drive an async pipeline call to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
