//! Domain types for the rowsync pipeline.
//!
//! Records arrive already normalised into typed field maps; this crate only
//! cares about their identity key and field-by-field equality.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Business identity of a row (for example the sheet's unique row number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(pub String);

impl RecordKey {
    /// Canonical form used for diffing: trimmed, inner whitespace collapsed
    /// to a single space, ASCII lower-case.
    pub fn normalized(&self) -> RecordKey {
        let collapsed = self.0.split_whitespace().collect::<Vec<_>>().join(" ");
        RecordKey(collapsed.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a single sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncId(pub Uuid);

impl SyncId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Records and snapshots
// ---------------------------------------------------------------------------

/// One normalised row of the external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(key: impl Into<RecordKey>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }

    /// Record with no fields yet.
    pub fn from_key(key: impl Into<RecordKey>) -> Self {
        Self::new(key, BTreeMap::new())
    }

    /// Builder-style helper used by tests and adapters.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Field-by-field equality; the key is compared separately by callers.
    pub fn same_fields(&self, other: &Record) -> bool {
        self.fields == other.fields
    }
}

/// Full point-in-time copy of the external source. Never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: Vec<Record>,
}

impl Snapshot {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Copy with every key in canonical form. When two rows collapse to the
    /// same key the later row wins, keeping the position of the first.
    pub fn normalized(&self) -> Snapshot {
        let mut positions: HashMap<RecordKey, usize> = HashMap::with_capacity(self.records.len());
        let mut records: Vec<Record> = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let key = record.key.normalized();
            let normalized = Record {
                key: key.clone(),
                fields: record.fields.clone(),
            };
            match positions.get(&key) {
                Some(&idx) => records[idx] = normalized,
                None => {
                    positions.insert(key, records.len());
                    records.push(normalized);
                }
            }
        }
        Snapshot { records }
    }

    /// Key → record index. Assumes keys are already unique.
    pub fn index(&self) -> HashMap<&RecordKey, &Record> {
        self.records.iter().map(|r| (&r.key, r)).collect()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.records.iter().find(|r| &r.key == key)
    }
}

impl FromIterator<Record> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Snapshot::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Three-way difference between two snapshots. The sets are disjoint by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub added: Vec<Record>,
    pub updated: Vec<Record>,
    pub deleted: Vec<RecordKey>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of store mutations this diff translates into.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Closed failure taxonomy shared by retry policy and run bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Network,
    Authentication,
    RateLimit,
    DataIntegrity,
    Validation,
    Permission,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::Network,
        ErrorType::Authentication,
        ErrorType::RateLimit,
        ErrorType::DataIntegrity,
        ErrorType::Validation,
        ErrorType::Permission,
        ErrorType::Unknown,
    ];

    /// Only transient classes are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorType::Network | ErrorType::RateLimit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::Authentication => "authentication",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::DataIntegrity => "data_integrity",
            ErrorType::Validation => "validation",
            ErrorType::Permission => "permission",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kicked off a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Selective,
    Manual,
    #[default]
    Scheduled,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Full => write!(f, "full"),
            SyncType::Selective => write!(f, "selective"),
            SyncType::Manual => write!(f, "manual"),
            SyncType::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Lifecycle of a sync run: `queued → in_progress → completed | partial | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Queued,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl SyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Partial
        )
    }

    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        match self {
            SyncStatus::Queued => matches!(next, SyncStatus::InProgress | SyncStatus::Failed),
            SyncStatus::InProgress => next.is_terminal(),
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Partial => false,
        }
    }

    /// Status of a batch given its counters.
    pub fn from_counts(success: usize, failed: usize) -> SyncStatus {
        if failed == 0 {
            SyncStatus::Completed
        } else if success == 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Partial
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Queued => "queued",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// One row per sync run. Terminal once `completed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: SyncId,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_items: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub skipped_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SyncRecord {
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Wall time of a finished run.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds().max(0))
    }
}

/// Append-only row describing one record that failed terminally in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub sync_id: SyncId,
    pub record_key: RecordKey,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub retry_count: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Exponential backoff policy. Pure value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Policy for reading the external source.
    pub const FETCH: RetryConfig = RetryConfig {
        max_retries: 3,
        initial_delay_ms: 1_000,
        max_delay_ms: 5_000,
        backoff_multiplier: 2.0,
    };

    /// Policy for applying a diff to the store.
    pub const APPLY: RetryConfig = RetryConfig {
        max_retries: 2,
        initial_delay_ms: 500,
        max_delay_ms: 2_000,
        backoff_multiplier: 2.0,
    };

    /// Policy for a single record during per-record fallback.
    pub const RECORD: RetryConfig = RetryConfig {
        max_retries: 2,
        initial_delay_ms: 200,
        max_delay_ms: 1_000,
        backoff_multiplier: 2.0,
    };

    /// Delay that follows `current`, capped at `max_delay_ms`.
    pub fn next_delay_ms(&self, current: u64) -> u64 {
        let next = (current as f64 * self.backoff_multiplier).round();
        if !next.is_finite() || next >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            next.max(0.0) as u64
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::FETCH
    }
}
