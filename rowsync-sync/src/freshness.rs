//! Snapshot freshness.
//!
//! A cached snapshot has two lifetimes:
//! - a physical TTL enforced by the [`CacheBackend`] (hard expiry), and
//! - a logical freshness threshold checked here (soft staleness).
//!
//! The soft threshold is normally much shorter, so a sync is triggered well
//! before the entry disappears and the previous snapshot is still around to
//! diff against.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::CacheBackend;
use crate::clock::{self, Clock};
use crate::error::SyncError;

/// Bookkeeping stored next to every cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub timestamp: DateTime<Utc>,
    /// Content hash of the serialized data.
    pub version: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

/// Answer to "is this snapshot stale?".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessStatus {
    pub last_update_time: Option<DateTime<Utc>>,
    pub is_stale: bool,
    /// `f64::INFINITY` when nothing is cached.
    pub age_in_minutes: f64,
}

impl FreshnessStatus {
    pub fn missing() -> Self {
        Self {
            last_update_time: None,
            is_stale: true,
            age_in_minutes: f64::INFINITY,
        }
    }

    pub fn has_entry(&self) -> bool {
        self.last_update_time.is_some()
    }
}

pub struct FreshnessGate {
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl FreshnessGate {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self::with_clock(cache, clock::system())
    }

    pub fn with_clock(cache: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Cached value and metadata, or `None` if absent or physically expired.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<CacheEntry<T>>, SyncError> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                // An unreadable entry is as good as no entry; the next set
                // overwrites it.
                tracing::warn!(key, error = %err, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Store `data` with a fresh timestamp, overwriting any previous entry.
    ///
    /// The timestamp never moves backwards for a key, even if the clock does.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl_seconds: u64,
    ) -> Result<CacheMetadata, SyncError> {
        let now = self.clock.now();
        let previous = self.metadata(key).await?.map(|meta| meta.timestamp);
        let timestamp = match previous {
            Some(prev) if prev > now => prev,
            _ => now,
        };

        let payload = serde_json::to_value(data)?;
        let version = content_version(&payload)?;
        let metadata = CacheMetadata {
            timestamp,
            version,
            ttl_seconds,
        };
        let entry = CacheEntry {
            data: payload,
            metadata: metadata.clone(),
        };
        self.cache
            .set_ex(key, ttl_seconds, serde_json::to_string(&entry)?)
            .await?;
        tracing::debug!(key, version = %metadata.version, "cache entry written");
        Ok(metadata)
    }

    /// Freshness of `key` against a soft threshold in minutes.
    pub async fn check_freshness(
        &self,
        key: &str,
        threshold_minutes: u64,
    ) -> Result<FreshnessStatus, SyncError> {
        let now = self.clock.now();
        Ok(match self.metadata(key).await? {
            Some(meta) => freshness_at(meta.timestamp, now, threshold_minutes),
            None => FreshnessStatus::missing(),
        })
    }

    pub async fn invalidate(&self, key: &str) -> Result<bool, SyncError> {
        let removed = self.cache.del(key).await?;
        if removed {
            tracing::info!(key, "cache entry invalidated");
        }
        Ok(removed)
    }

    /// Remove every key matching `pattern`. Returns how many were removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, SyncError> {
        let mut removed = 0;
        for key in self.cache.keys(pattern).await? {
            if self.cache.del(&key).await? {
                removed += 1;
            }
        }
        tracing::info!(pattern, removed, "cache entries invalidated");
        Ok(removed)
    }

    async fn metadata(&self, key: &str) -> Result<Option<CacheMetadata>, SyncError> {
        Ok(self
            .get::<serde_json::Value>(key)
            .await?
            .map(|entry| entry.metadata))
    }
}

/// Pure freshness rule: stale when `age >= threshold`.
pub fn freshness_at(
    last_update: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_minutes: u64,
) -> FreshnessStatus {
    let age_ms = (now - last_update).num_milliseconds().max(0);
    let age_in_minutes = age_ms as f64 / 60_000.0;
    FreshnessStatus {
        last_update_time: Some(last_update),
        is_stale: age_in_minutes >= threshold_minutes as f64,
        age_in_minutes,
    }
}

fn content_version(payload: &serde_json::Value) -> Result<String, SyncError> {
    let bytes = serde_json::to_vec(payload)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..8]))
}

/// Format age from a timestamp, e.g. `"42s"`, `"5m"`, `"3h"`, `"2d"`.
pub fn format_datetime_age(timestamp: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(timestamp).num_seconds().max(0) as u64;
    format_seconds(age)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use rowsync_core::{Record, Snapshot};

    fn gate() -> (FreshnessGate, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let cache = Arc::new(MemoryCache::with_clock(shared.clone()));
        (FreshnessGate::with_clock(cache, shared), clock)
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(vec![Record::from_key("1").with_field("price", 100)])
    }

    #[tokio::test]
    async fn missing_entry_is_stale_with_infinite_age() {
        let (gate, _) = gate();
        let status = gate.check_freshness("k", 5).await.unwrap();
        assert!(status.is_stale);
        assert!(status.age_in_minutes.is_infinite());
        assert!(status.last_update_time.is_none());
    }

    #[tokio::test]
    async fn stale_exactly_at_threshold() {
        let (gate, clock) = gate();
        gate.set("k", &snapshot(), 3600).await.unwrap();

        for (minutes, expect_stale) in [(0, false), (4, false), (5, true), (6, true)] {
            let start = clock.now();
            clock.advance(Duration::minutes(minutes));
            let status = gate.check_freshness("k", 5).await.unwrap();
            assert_eq!(status.is_stale, expect_stale, "t = {minutes}m");
            clock.set(start);
        }
    }

    #[tokio::test]
    async fn physical_expiry_removes_the_entry() {
        let (gate, clock) = gate();
        gate.set("k", &snapshot(), 60).await.unwrap();
        clock.advance(Duration::seconds(61));
        assert!(gate.get::<Snapshot>("k").await.unwrap().is_none());
        assert!(!gate.check_freshness("k", 5).await.unwrap().has_entry());
    }

    #[tokio::test]
    async fn set_overwrites_and_round_trips_data() {
        let (gate, _) = gate();
        gate.set("k", &Snapshot::empty(), 60).await.unwrap();
        let meta = gate.set("k", &snapshot(), 120).await.unwrap();

        let entry = gate.get::<Snapshot>("k").await.unwrap().expect("entry");
        assert_eq!(entry.data, snapshot());
        assert_eq!(entry.metadata, meta);
        assert_eq!(entry.metadata.ttl_seconds, 120);
    }

    #[tokio::test]
    async fn timestamp_never_moves_backwards() {
        let (gate, clock) = gate();
        let first = gate.set("k", &snapshot(), 3600).await.unwrap();
        clock.advance(Duration::minutes(-10));
        let second = gate.set("k", &snapshot(), 3600).await.unwrap();
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn version_tracks_content() {
        let (gate, _) = gate();
        let a = gate.set("k", &snapshot(), 60).await.unwrap();
        let b = gate.set("k", &snapshot(), 60).await.unwrap();
        let c = gate.set("k", &Snapshot::empty(), 60).await.unwrap();
        assert_eq!(a.version, b.version);
        assert_ne!(a.version, c.version);
    }

    #[tokio::test]
    async fn invalidate_pattern_counts_removed_keys() {
        let (gate, _) = gate();
        gate.set("sheet:a", &snapshot(), 60).await.unwrap();
        gate.set("sheet:b", &snapshot(), 60).await.unwrap();
        gate.set("other", &snapshot(), 60).await.unwrap();

        assert_eq!(gate.invalidate_pattern("sheet:*").await.unwrap(), 2);
        assert!(gate.get::<Snapshot>("other").await.unwrap().is_some());
        assert!(gate.invalidate("other").await.unwrap());
        assert!(!gate.invalidate("other").await.unwrap());
    }

    #[test]
    fn compact_age_formatting() {
        assert_eq!(format_seconds(0), "0s");
        assert_eq!(format_seconds(65), "1m");
        assert_eq!(format_seconds(3 * 3600 + 5), "3h");
        assert_eq!(format_seconds(2 * 86_400), "2d");
        assert_eq!(format_datetime_age(Utc::now()), "0s");
    }
}
