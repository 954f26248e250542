//! Snapshot diffing and diff application.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use rowsync_core::{Diff, Record, RecordKey, Snapshot};

use crate::batch::{BatchApplier, BatchOutcome, RecordFailure};
use crate::error::{SourceError, StoreError, SyncError};
use crate::source::SnapshotSource;

/// What an apply did to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// No record failed.
    pub success: bool,
    pub records_added: usize,
    pub records_updated: usize,
    pub records_deleted: usize,
    pub errors: Vec<RecordFailure>,
    pub transient_errors: usize,
    pub permanent_errors: usize,
    pub validation_errors: usize,
    #[serde(skip)]
    pub failed_upserts: HashSet<RecordKey>,
    #[serde(skip)]
    pub failed_deletes: HashSet<RecordKey>,
}

impl ApplyResult {
    pub fn total(&self) -> usize {
        self.succeeded() + self.errors.len()
    }

    pub fn succeeded(&self) -> usize {
        self.records_added + self.records_updated + self.records_deleted
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    pub fn has_changes(&self) -> bool {
        self.succeeded() > 0
    }
}

/// Pulls the external snapshot and turns diffs into store mutations.
pub struct DiffEngine {
    source: Arc<dyn SnapshotSource>,
    applier: BatchApplier,
}

impl DiffEngine {
    pub fn new(source: Arc<dyn SnapshotSource>, applier: BatchApplier) -> Self {
        Self { source, applier }
    }

    pub fn applier(&self) -> &BatchApplier {
        &self.applier
    }

    /// Read the whole source with keys in canonical form.
    ///
    /// Not retried here; callers choose the policy.
    pub async fn fetch_latest_snapshot(&self) -> Result<Snapshot, SourceError> {
        let raw = Snapshot::new(self.source.read_all().await?);
        let snapshot = raw.normalized();
        if snapshot.len() != raw.len() {
            tracing::warn!(
                rows = raw.len(),
                unique = snapshot.len(),
                "duplicate source keys collapsed, last row wins"
            );
        }
        Ok(snapshot)
    }

    /// Contents of the store, in canonical key form.
    pub async fn load_store_snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.applier.store().load_all().await?.normalized())
    }

    /// Upsert added and updated records, then delete removed keys.
    ///
    /// Record-level failures are reported in the result. The call only fails
    /// when nothing landed and every failure was transient, which means the
    /// store is unreachable and the whole apply is worth retrying.
    pub async fn apply(&self, diff: &Diff) -> Result<ApplyResult, SyncError> {
        let upserts: Vec<Record> = diff
            .added
            .iter()
            .chain(diff.updated.iter())
            .cloned()
            .collect();
        let upserted = self.applier.upsert(&upserts).await;
        let deleted = self.applier.delete(&diff.deleted).await;

        let mut combined = BatchOutcome::default();
        combined.merge(upserted.clone());
        combined.merge(deleted.clone());
        if combined.is_total_transient_failure() {
            let first = combined
                .errors
                .first()
                .map(|f| f.message.clone())
                .unwrap_or_default();
            return Err(StoreError::new(format!(
                "store unreachable, {} of {} changes failed: {first}",
                combined.failed, combined.total
            ))
            .into());
        }

        let failed_upserts: HashSet<RecordKey> = upserted
            .errors
            .iter()
            .map(|f| f.record_key.clone())
            .collect();
        let failed_deletes: HashSet<RecordKey> = deleted
            .errors
            .iter()
            .map(|f| f.record_key.clone())
            .collect();
        let landed = |records: &[Record]| {
            records
                .iter()
                .filter(|r| !failed_upserts.contains(&r.key))
                .count()
        };

        let result = ApplyResult {
            success: combined.failed == 0,
            records_added: landed(&diff.added),
            records_updated: landed(&diff.updated),
            records_deleted: deleted.success,
            errors: combined.errors,
            transient_errors: combined.transient_errors,
            permanent_errors: combined.permanent_errors,
            validation_errors: combined.validation_errors,
            failed_upserts,
            failed_deletes,
        };
        tracing::info!(
            added = result.records_added,
            updated = result.records_updated,
            deleted = result.records_deleted,
            failed = result.failed(),
            "diff applied"
        );
        Ok(result)
    }
}

/// Three-way diff between two snapshots with unique keys.
///
/// `added` and `updated` follow `current` order, `deleted` follows
/// `previous` order. Linear in the total number of records.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Diff {
    let before = previous.index();
    let after = current.index();

    let mut out = Diff::default();
    for record in current {
        match before.get(&record.key) {
            None => out.added.push(record.clone()),
            Some(old) if !old.same_fields(record) => out.updated.push(record.clone()),
            Some(_) => {}
        }
    }
    for record in previous {
        if !after.contains_key(&record.key) {
            out.deleted.push(record.key.clone());
        }
    }
    out
}

/// Snapshot that matches what actually landed in the store.
///
/// Failed upserts fall back to their previous value (or vanish if they were
/// new); failed deletes keep their previous value. Caching this instead of
/// `current` makes the next run re-diff exactly the records that did not land.
pub fn reconcile(previous: &Snapshot, current: &Snapshot, result: &ApplyResult) -> Snapshot {
    if result.failed_upserts.is_empty() && result.failed_deletes.is_empty() {
        return current.clone();
    }
    let before: HashMap<&RecordKey, &Record> = previous.index();

    let mut records: Vec<Record> = current
        .iter()
        .filter_map(|record| {
            if result.failed_upserts.contains(&record.key) {
                before.get(&record.key).map(|old| (*old).clone())
            } else {
                Some(record.clone())
            }
        })
        .collect();
    records.extend(
        previous
            .iter()
            .filter(|record| result.failed_deletes.contains(&record.key))
            .cloned(),
    );
    Snapshot::new(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryExecutor;
    use crate::store::{MemoryStore, RecordStore};
    use async_trait::async_trait;
    use rowsync_core::RetryConfig;

    fn rec(key: &str, price: i64) -> Record {
        Record::from_key(key).with_field("price", price)
    }

    fn snap(records: &[Record]) -> Snapshot {
        Snapshot::new(records.to_vec())
    }

    struct FixedSource(Vec<Record>);

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn read_all(&self) -> Result<Vec<Record>, SourceError> {
            Ok(self.0.clone())
        }

        async fn read_sample(&self, _column: &str, n: usize) -> Result<Vec<String>, SourceError> {
            Ok(self.0.iter().take(n).map(|r| r.key.to_string()).collect())
        }
    }

    fn engine(source: Vec<Record>, store: Arc<dyn RecordStore>) -> DiffEngine {
        DiffEngine::new(
            Arc::new(FixedSource(source)),
            BatchApplier::new(store, Arc::new(RetryExecutor::new()), RetryConfig::RECORD),
        )
    }

    #[test]
    fn three_way_diff() {
        let previous = snap(&[rec("1", 100), rec("2", 200), rec("3", 300)]);
        let current = snap(&[rec("2", 250), rec("3", 300), rec("4", 400)]);

        let d = diff(&previous, &current);
        assert_eq!(d.added, vec![rec("4", 400)]);
        assert_eq!(d.updated, vec![rec("2", 250)]);
        assert_eq!(d.deleted, vec![RecordKey::from("1")]);
    }

    #[test]
    fn identical_snapshots_have_empty_diff() {
        let s = snap(&[rec("1", 1), rec("2", 2)]);
        assert!(diff(&s, &s).is_empty());
        assert!(diff(&Snapshot::empty(), &Snapshot::empty()).is_empty());
    }

    #[test]
    fn field_added_counts_as_update() {
        let previous = snap(&[rec("1", 1)]);
        let current = snap(&[rec("1", 1).with_field("beds", 3)]);
        assert_eq!(diff(&previous, &current).updated.len(), 1);
    }

    #[tokio::test]
    async fn fetch_normalizes_key_variants() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let engine = engine(vec![rec(" Row 1", 1), rec("row   1 ", 2)], store);
        let snapshot = engine.fetch_latest_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records()[0], rec("row 1", 2));

        // A case-only change on the cached side is not churn.
        let cached = snap(&[rec("ROW 1", 2)]).normalized();
        assert!(diff(&cached, &snapshot).is_empty());
    }

    #[tokio::test]
    async fn apply_writes_every_change() {
        let store = Arc::new(MemoryStore::with_records([rec("1", 1), rec("2", 2)]));
        let engine = engine(vec![], store.clone());
        let d = diff(
            &snap(&[rec("1", 1), rec("2", 2)]),
            &snap(&[rec("2", 3), rec("5", 5)]),
        );

        let result = engine.apply(&d).await.unwrap();
        assert!(result.success);
        assert_eq!(
            (result.records_added, result.records_updated, result.records_deleted),
            (1, 1, 1)
        );
        assert_eq!(
            store.load_all().await.unwrap(),
            snap(&[rec("2", 3), rec("5", 5)])
        );
    }

    #[test]
    fn reconcile_reverts_failed_keys() {
        let previous = snap(&[rec("1", 1), rec("2", 2), rec("3", 3)]);
        let current = snap(&[rec("1", 10), rec("2", 20), rec("4", 4)]);
        let result = ApplyResult {
            failed_upserts: [RecordKey::from("1"), RecordKey::from("4")]
                .into_iter()
                .collect(),
            failed_deletes: [RecordKey::from("3")].into_iter().collect(),
            ..ApplyResult::default()
        };

        let cached = reconcile(&previous, &current, &result);
        assert_eq!(cached, snap(&[rec("1", 1), rec("2", 20), rec("3", 3)]));

        // Next run re-diffs exactly the failed keys.
        let next = diff(&cached, &current);
        assert_eq!(next.added, vec![rec("4", 4)]);
        assert_eq!(next.updated, vec![rec("1", 10)]);
        assert_eq!(next.deleted, vec![RecordKey::from("3")]);
    }
}
