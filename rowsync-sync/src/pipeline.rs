//! File-backed orchestrator wiring shared by the CLI and the daemon.

use std::path::Path;
use std::sync::Arc;

use rowsync_core::{paths, SyncConfig};

use crate::batch::BatchApplier;
use crate::cache::FileCache;
use crate::diff::DiffEngine;
use crate::error::SyncError;
use crate::flight::FileLease;
use crate::freshness::FreshnessGate;
use crate::metrics::MetricsRecorder;
use crate::orchestrator::{Components, OrchestratorSettings, SyncOrchestrator};
use crate::retry::RetryExecutor;
use crate::source::JsonFileSource;
use crate::store::JsonFileStore;
use crate::tracker::SyncStateTracker;

/// Build the orchestrator for `home` from `config`.
///
/// Every process built against the same home shares the cache directory,
/// run history, metrics and the lease file, so a CLI sync and the daemon
/// never run concurrently.
pub fn build_at(home: &Path, config: &SyncConfig) -> Result<SyncOrchestrator, SyncError> {
    config.validate()?;

    let executor = Arc::new(RetryExecutor::new());
    let source = Arc::new(JsonFileSource::new(
        config.source_path_at(home),
        config.key_column.clone(),
    ));
    let store = Arc::new(JsonFileStore::new(config.store_path_at(home)));
    let applier = BatchApplier::new(store, executor.clone(), config.record_retry);

    let components = Components {
        gate: FreshnessGate::new(Arc::new(FileCache::new(paths::cache_dir(home)))),
        engine: DiffEngine::new(source, applier),
        executor,
        tracker: Arc::new(SyncStateTracker::open(paths::runs_path(home))?),
        metrics: Arc::new(MetricsRecorder::open(paths::metrics_path(home))?),
        flight: Arc::new(FileLease::new(paths::lease_path(home), config.lease_ttl())),
    };
    tracing::debug!(home = %home.display(), source = %config.source_path_at(home).display(), "pipeline built");
    Ok(SyncOrchestrator::new(
        components,
        OrchestratorSettings::from_config(config),
    ))
}

/// Load `config.yaml` under `home` and build from it.
pub fn load_and_build_at(home: &Path) -> Result<(SyncConfig, SyncOrchestrator), SyncError> {
    let config = rowsync_core::config::load_at(home)?;
    let orchestrator = build_at(home, &config)?;
    Ok((config, orchestrator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_backed_pipeline_syncs_and_goes_fresh() {
        let home = TempDir::new().unwrap();
        let config = SyncConfig::default();
        std::fs::create_dir_all(paths::root(home.path())).unwrap();
        std::fs::write(
            config.source_path_at(home.path()),
            json!([{"id": 1, "price": 10}, {"id": 2, "price": 20}]).to_string(),
        )
        .unwrap();

        let orchestrator = build_at(home.path(), &config).unwrap();
        let first = orchestrator.sync_if_stale(5).await;
        assert!(first.triggered, "{first:?}");
        assert_eq!(first.records_added, 2);
        assert!(config.store_path_at(home.path()).exists());
        assert!(paths::runs_path(home.path()).exists());
        assert!(!paths::lease_path(home.path()).exists());

        let second = orchestrator.sync_if_stale(5).await;
        assert!(!second.triggered);
    }

    #[tokio::test]
    async fn orchestrators_on_one_home_share_history_and_metrics() {
        let home = TempDir::new().unwrap();
        let config = SyncConfig::default();
        std::fs::create_dir_all(paths::root(home.path())).unwrap();
        std::fs::write(
            config.source_path_at(home.path()),
            json!([{"id": 1, "price": 10}]).to_string(),
        )
        .unwrap();

        let cli = build_at(home.path(), &config).unwrap();
        let daemon = build_at(home.path(), &config).unwrap();
        let first = cli.force_sync().await;
        let second = daemon.force_sync().await;
        assert!(first.triggered && second.triggered);

        let reopened = SyncStateTracker::open(paths::runs_path(home.path())).unwrap();
        let ids: Vec<_> = reopened.recent_runs(10).await.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.sync_id.unwrap()));
        assert!(ids.contains(&second.sync_id.unwrap()));
        assert_eq!(cli.tracker().last_sync().await.map(|r| r.id), second.sync_id);

        let metrics = MetricsRecorder::open(paths::metrics_path(home.path())).unwrap();
        assert_eq!(metrics.summary().await.syncs_total, 2);
    }

    #[tokio::test]
    async fn corrupt_cache_file_counts_as_stale() {
        let home = TempDir::new().unwrap();
        let config = SyncConfig::default();
        std::fs::create_dir_all(paths::root(home.path())).unwrap();
        std::fs::write(
            config.source_path_at(home.path()),
            json!([{"id": 1, "price": 10}]).to_string(),
        )
        .unwrap();

        let orchestrator = build_at(home.path(), &config).unwrap();
        assert!(orchestrator.sync_if_stale(5).await.success);
        for entry in std::fs::read_dir(paths::cache_dir(home.path())).unwrap() {
            std::fs::write(entry.unwrap().path(), "{truncated").unwrap();
        }

        let result = orchestrator.sync_if_stale(5).await;
        assert!(result.triggered, "{result:?}");
        assert!(result.success);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let home = TempDir::new().unwrap();
        let config = SyncConfig {
            key_column: " ".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(
            build_at(home.path(), &config),
            Err(SyncError::Config(_))
        ));
    }
}
