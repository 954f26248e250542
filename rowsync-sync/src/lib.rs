//! # rowsync-sync
//!
//! Reconciliation pipeline between an external tabular source and the
//! record store.
//!
//! [`SyncOrchestrator::sync_if_stale`] is the entry point. Use
//! [`pipeline::build_at`] for the file-backed wiring under `~/.rowsync/`, or
//! assemble [`orchestrator::Components`] by hand to inject other backends.

pub mod batch;
pub mod cache;
pub mod clock;
pub mod diff;
pub mod error;
pub mod flight;
pub mod freshness;
pub mod metrics;
pub mod orchestrator;
mod persist;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod store;
pub mod tracker;

pub use batch::{BatchApplier, BatchOutcome, RecordFailure};
pub use cache::{CacheBackend, FileCache, MemoryCache};
pub use diff::{diff, ApplyResult, DiffEngine};
pub use error::{Classify, SourceError, StoreError, SyncError};
pub use flight::{FileLease, FlightGuard, FlightPermit, LocalFlight};
pub use freshness::{FreshnessGate, FreshnessStatus};
pub use metrics::MetricsRecorder;
pub use orchestrator::{AutoSyncResult, DiffPreview, SyncOrchestrator, SyncReason};
pub use retry::RetryExecutor;
pub use source::{JsonFileSource, SnapshotSource};
pub use store::{JsonFileStore, MemoryStore, RecordStore};
pub use tracker::{HealthStatus, StatusSurface, SyncStateTracker};
