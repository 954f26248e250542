//! Key/value cache backends with per-key expiry.
//!
//! [`FreshnessGate`](crate::freshness::FreshnessGate) only needs `get`,
//! `set_ex`, `del` and `keys`, so anything from an in-process map to a
//! networked cache can sit behind [`CacheBackend`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::clock::{self, Clock};
use crate::error::{io_err, SyncError};
use crate::persist;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Value for `key`, or `None` when absent or past its expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    /// Store `value` under `key`, expiring after `ttl_seconds`.
    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<(), SyncError>;

    /// Remove `key`. Returns whether an entry was removed.
    async fn del(&self, key: &str) -> Result<bool, SyncError>;

    /// Live keys matching a glob pattern (`*`, `?`, `[...]`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, SyncError>;
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<GlobMatcher, SyncError> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|err| SyncError::Pattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })
}

/// Longest honoured TTL (100 years); larger values are clamped.
const MAX_TTL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

fn expiry(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    let ttl = Duration::seconds(ttl_seconds.min(MAX_TTL_SECONDS) as i64);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process cache. Expired entries are dropped lazily on access.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<(), SyncError> {
        let expires_at = expiry(self.clock.now(), ttl_seconds);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, SyncError> {
        let matcher = compile_pattern(pattern)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| matcher.is_match(key.as_str()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// FileCache
// ---------------------------------------------------------------------------

/// On-disk payload: one JSON file per key under the cache directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    key: String,
    expires_at: DateTime<Utc>,
    value: String,
}

/// Cache persisted under `~/.rowsync/cache/`, surviving process restarts.
///
/// File names are the SHA-256 of the key so arbitrary key text is safe.
#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, clock::system())
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.json", &digest[..32]))
    }

    fn read_live(&self, path: &Path) -> Result<Option<FileEntry>, SyncError> {
        let Some(entry) = persist::load_json::<FileEntry>(path)? else {
            return Ok(None);
        };
        if entry.expires_at <= self.clock.now() {
            persist::remove_if_exists(path)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

#[async_trait]
impl CacheBackend for FileCache {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let path = self.entry_path(key);
        let entry = match self.read_live(&path) {
            Ok(entry) => entry,
            // A torn or foreign file is a miss; drop it so the next set wins.
            Err(SyncError::Json(err)) => {
                tracing::warn!(path = %path.display(), error = %err, "discarding unreadable cache file");
                persist::remove_if_exists(&path)?;
                None
            }
            Err(err) => return Err(err),
        };
        Ok(entry
            .filter(|entry| entry.key == key)
            .map(|entry| entry.value))
    }

    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<(), SyncError> {
        let entry = FileEntry {
            key: key.to_string(),
            expires_at: expiry(self.clock.now(), ttl_seconds),
            value,
        };
        persist::save_json(&self.entry_path(key), &entry)
    }

    async fn del(&self, key: &str) -> Result<bool, SyncError> {
        persist::remove_if_exists(&self.entry_path(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, SyncError> {
        let matcher = compile_pattern(pattern)?;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.dir, err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_live(&path) {
                Ok(Some(live)) if matcher.is_match(live.key.as_str()) => keys.push(live.key),
                Ok(_) => {}
                Err(SyncError::Json(err)) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable cache file");
                }
                Err(err) => return Err(err),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn clock() -> ManualClock {
        ManualClock::new(Utc::now())
    }

    #[tokio::test]
    async fn memory_entry_expires_after_ttl() {
        let clock = clock();
        let cache = MemoryCache::with_clock(Arc::new(clock.clone()));
        cache.set_ex("k", 60, "v".to_string()).await.unwrap();

        clock.advance(Duration::seconds(59));
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_keys_match_glob_and_skip_expired() {
        let clock = clock();
        let cache = MemoryCache::with_clock(Arc::new(clock.clone()));
        cache.set_ex("sheet:listings", 10, "a".into()).await.unwrap();
        cache.set_ex("sheet:agents", 100, "b".into()).await.unwrap();
        cache.set_ex("other", 100, "c".into()).await.unwrap();

        assert_eq!(
            cache.keys("sheet:*").await.unwrap(),
            vec!["sheet:agents".to_string(), "sheet:listings".to_string()]
        );
        clock.advance(Duration::seconds(20));
        assert_eq!(
            cache.keys("sheet:*").await.unwrap(),
            vec!["sheet:agents".to_string()]
        );
    }

    #[tokio::test]
    async fn file_cache_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = FileCache::new(tmp.path());
            cache.set_ex("rowsync:snapshot", 3600, "[]".into()).await.unwrap();
        }
        let reopened = FileCache::new(tmp.path());
        assert_eq!(
            reopened.get("rowsync:snapshot").await.unwrap(),
            Some("[]".to_string())
        );
        assert_eq!(
            reopened.keys("rowsync:*").await.unwrap(),
            vec!["rowsync:snapshot".to_string()]
        );
    }

    #[tokio::test]
    async fn file_cache_expiry_removes_file() {
        let tmp = TempDir::new().unwrap();
        let clock = clock();
        let cache = FileCache::with_clock(tmp.path(), Arc::new(clock.clone()));
        cache.set_ex("k", 5, "v".into()).await.unwrap();
        let path = cache.entry_path("k");
        assert!(path.exists());

        clock.advance(Duration::seconds(6));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_cache_del_reports_presence() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        cache.set_ex("k", 5, "v".into()).await.unwrap();
        assert!(cache.del("k").await.unwrap());
        assert!(!cache.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_glob_is_reported() {
        let cache = MemoryCache::new();
        let err = cache.keys("[unclosed").await.unwrap_err();
        assert!(matches!(err, SyncError::Pattern { .. }));
    }

    #[tokio::test]
    async fn corrupt_file_entry_reads_as_miss_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let path = cache.entry_path("rowsync:snapshot");
        std::fs::write(&path, "{\"key\": \"rowsync:snap").unwrap();

        assert_eq!(cache.get("rowsync:snapshot").await.unwrap(), None);
        assert!(!path.exists());

        cache
            .set_ex("rowsync:snapshot", 60, "v".to_string())
            .await
            .unwrap();
        assert_eq!(
            cache.get("rowsync:snapshot").await.unwrap(),
            Some("v".to_string())
        );
    }
}
