//! Rowsync core library: domain types, error taxonomy, configuration.
//!
//! Public API surface:
//! - [`types`]: records, snapshots, diffs, sync run bookkeeping
//! - [`classify`]: the single [`ErrorType`] classifier
//! - [`config`]: `~/.rowsync/config.yaml` load / save
//! - [`paths`]: on-disk layout under `~/.rowsync/`
//! - [`error`]: [`ConfigError`]

pub mod classify;
pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use classify::classify;
pub use config::SyncConfig;
pub use error::ConfigError;
pub use types::{
    Diff, ErrorType, Record, RecordKey, RetryConfig, Snapshot, SyncErrorEntry, SyncId,
    SyncRecord, SyncStatus, SyncType,
};
