//! `~/.rowsync/config.yaml`.
//!
//! # API pattern
//!
//! Like the rest of the crate, every function that touches disk comes in two
//! forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A missing config file is not an error: [`load_at`] returns defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::paths;
use crate::types::RetryConfig;

/// Output format for daemon logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Everything the pipeline and daemon need to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Exported sheet (JSON array of row objects). Relative to `~/.rowsync/`.
    pub source_path: PathBuf,
    /// Column holding the business identity of a row.
    pub key_column: String,
    /// JSON store document. Relative to `~/.rowsync/`.
    pub store_path: PathBuf,
    pub cache_key: String,
    /// Physical expiry of the cached snapshot.
    pub cache_ttl_seconds: u64,
    /// Logical freshness threshold; normally much shorter than the TTL.
    pub stale_after_minutes: u64,
    pub poll_interval_seconds: u64,
    /// Deadline for one sync run, end to end.
    pub run_timeout_seconds: u64,
    pub fetch_retry: RetryConfig,
    pub apply_retry: RetryConfig,
    pub record_retry: RetryConfig,
    pub lease_ttl_seconds: u64,
    /// Re-check freshness as soon as the source file changes.
    pub watch_source: bool,
    pub log_format: LogFormat,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("source.json"),
            key_column: "id".to_string(),
            store_path: PathBuf::from("store.json"),
            cache_key: "rowsync:snapshot".to_string(),
            cache_ttl_seconds: 3_600,
            stale_after_minutes: 5,
            poll_interval_seconds: 60,
            run_timeout_seconds: 300,
            fetch_retry: RetryConfig::FETCH,
            apply_retry: RetryConfig::APPLY,
            record_retry: RetryConfig::RECORD,
            lease_ttl_seconds: 600,
            watch_source: true,
            log_format: LogFormat::Pretty,
        }
    }
}

impl SyncConfig {
    pub fn source_path_at(&self, home: &Path) -> PathBuf {
        paths::resolve(home, &self.source_path)
    }

    pub fn store_path_at(&self, home: &Path) -> PathBuf {
        paths::resolve(home, &self.store_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    /// Reject values that would make the pipeline spin or never run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_column.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "key_column",
                reason: "must not be empty".to_string(),
            });
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_seconds",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.run_timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "run_timeout_seconds",
                reason: "must be at least 1".to_string(),
            });
        }
        // A live run must never outlast its lease.
        if self.lease_ttl_seconds <= self.run_timeout_seconds {
            return Err(ConfigError::Invalid {
                field: "lease_ttl_seconds",
                reason: format!(
                    "must exceed run_timeout_seconds ({}), got {}",
                    self.run_timeout_seconds, self.lease_ttl_seconds
                ),
            });
        }
        for (field, retry) in [
            ("fetch_retry", &self.fetch_retry),
            ("apply_retry", &self.apply_retry),
            ("record_retry", &self.record_retry),
        ] {
            if retry.backoff_multiplier < 1.0 || !retry.backoff_multiplier.is_finite() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!(
                        "backoff_multiplier must be >= 1.0, got {}",
                        retry.backoff_multiplier
                    ),
                });
            }
            if retry.initial_delay_ms > retry.max_delay_ms {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "initial_delay_ms exceeds max_delay_ms".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Load the config for `home`, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = paths::config_path(home);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&paths::home()?)
}

/// Save atomically: serialize → `config.yaml.tmp` → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    config.validate()?;
    let root = paths::root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        set_dir_permissions(&root)?;
    }
    let path = paths::config_path(home);
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_file_name("config.yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    save_at(&paths::home()?, config)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}
