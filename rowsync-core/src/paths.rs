//! On-disk layout.
//!
//! ```text
//! ~/.rowsync/
//!   config.yaml
//!   store.json            (default JSON store)
//!   cache/<key>.json      (one file per cache key)
//!   state/runs.json       (sync runs + error log)
//!   state/metrics.json    (metric time series)
//!   run/sync.lease        (single-flight lease)
//!   daemon.sock
//!   logs/daemon.log, logs/daemon-err.log
//! ```
//!
//! Every helper takes an explicit `home`; tests pass a `TempDir`.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const ROOT_DIR: &str = ".rowsync";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

pub fn root(home: &Path) -> PathBuf {
    home.join(ROOT_DIR)
}

pub fn config_path(home: &Path) -> PathBuf {
    root(home).join(CONFIG_FILE)
}

pub fn default_store_path(home: &Path) -> PathBuf {
    root(home).join("store.json")
}

pub fn default_source_path(home: &Path) -> PathBuf {
    root(home).join("source.json")
}

pub fn cache_dir(home: &Path) -> PathBuf {
    root(home).join("cache")
}

pub fn state_dir(home: &Path) -> PathBuf {
    root(home).join("state")
}

pub fn runs_path(home: &Path) -> PathBuf {
    state_dir(home).join("runs.json")
}

pub fn metrics_path(home: &Path) -> PathBuf {
    state_dir(home).join("metrics.json")
}

pub fn run_dir(home: &Path) -> PathBuf {
    root(home).join("run")
}

pub fn lease_path(home: &Path) -> PathBuf {
    run_dir(home).join("sync.lease")
}

pub fn socket_path(home: &Path) -> PathBuf {
    root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// are anchored at `~/.rowsync/`.
pub fn resolve(home: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root(home).join(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_anchor_at_root() {
        let home = Path::new("/home/ops");
        assert_eq!(
            resolve(home, Path::new("sheet.json")),
            PathBuf::from("/home/ops/.rowsync/sheet.json")
        );
        assert_eq!(
            resolve(home, Path::new("/srv/sheet.json")),
            PathBuf::from("/srv/sheet.json")
        );
    }

    #[test]
    fn layout_is_rooted_under_dot_rowsync() {
        let home = Path::new("/h");
        assert_eq!(socket_path(home), PathBuf::from("/h/.rowsync/daemon.sock"));
        assert_eq!(lease_path(home), PathBuf::from("/h/.rowsync/run/sync.lease"));
        assert_eq!(
            stderr_log_path(home),
            PathBuf::from("/h/.rowsync/logs/daemon-err.log")
        );
    }
}
