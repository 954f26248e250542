//! Config persistence and on-disk layout integration tests.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use rowsync_core::{config, paths, ConfigError, SyncConfig};

#[test]
fn save_creates_config_under_dot_rowsync() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &SyncConfig::default()).expect("save");

    home.child(".rowsync/config.yaml")
        .assert(predicate::path::exists());
    home.child(".rowsync/config.yaml")
        .assert(predicate::str::contains("key_column: id"));
}

#[test]
fn relative_source_path_resolves_under_root() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let config = SyncConfig::default();
    assert_eq!(
        config.source_path_at(home.path()),
        paths::root(home.path()).join("source.json")
    );
}

#[test]
fn invalid_values_are_rejected_on_load() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rowsync/config.yaml")
        .write_str("poll_interval_seconds: 0\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(
        matches!(err, ConfigError::Invalid { field: "poll_interval_seconds", .. }),
        "got: {err}"
    );
}

#[test]
fn retry_policies_round_trip_through_yaml() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut config = SyncConfig::default();
    config.fetch_retry.max_retries = 7;
    config.record_retry.max_delay_ms = 9_000;
    config::save_at(home.path(), &config).expect("save");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.fetch_retry.max_retries, 7);
    assert_eq!(loaded.record_retry.max_delay_ms, 9_000);
}
