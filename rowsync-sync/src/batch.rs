//! Batched store writes with poison-record isolation.
//!
//! A batch is first sent as one bulk call. If that fails, every item is
//! retried on its own under the per-record retry policy so a single bad
//! record cannot block the rest.

use std::sync::Arc;

use serde::Serialize;

use rowsync_core::{ErrorType, Record, RecordKey, RetryConfig, SyncStatus};

use crate::error::Classify;
use crate::retry::RetryExecutor;
use crate::store::RecordStore;

/// A record that failed terminally.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    pub record_key: RecordKey,
    pub error_type: ErrorType,
    pub message: String,
    pub retry_count: u32,
}

/// Counters for one batch. `errors` lists every failed item.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub transient_errors: usize,
    pub permanent_errors: usize,
    pub validation_errors: usize,
    pub errors: Vec<RecordFailure>,
    /// The bulk call failed and items were applied one by one.
    pub used_fallback: bool,
}

impl BatchOutcome {
    pub fn status(&self) -> SyncStatus {
        SyncStatus::from_counts(self.success, self.failed)
    }

    /// Every item failed and every failure was transient: the store itself
    /// is probably unreachable.
    pub fn is_total_transient_failure(&self) -> bool {
        self.total > 0
            && self.success == 0
            && self.errors.iter().all(|e| e.error_type.is_retryable())
    }

    fn record(&mut self, failure: RecordFailure) {
        self.failed += 1;
        match failure.error_type {
            ErrorType::Network | ErrorType::RateLimit => self.transient_errors += 1,
            ErrorType::Validation | ErrorType::DataIntegrity => self.validation_errors += 1,
            ErrorType::Authentication | ErrorType::Permission | ErrorType::Unknown => {
                self.permanent_errors += 1
            }
        }
        self.errors.push(failure);
    }

    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: BatchOutcome) {
        self.total += other.total;
        self.success += other.success;
        self.failed += other.failed;
        self.transient_errors += other.transient_errors;
        self.permanent_errors += other.permanent_errors;
        self.validation_errors += other.validation_errors;
        self.errors.extend(other.errors);
        self.used_fallback |= other.used_fallback;
    }
}

pub struct BatchApplier {
    store: Arc<dyn RecordStore>,
    executor: Arc<RetryExecutor>,
    record_retry: RetryConfig,
}

impl BatchApplier {
    pub fn new(
        store: Arc<dyn RecordStore>,
        executor: Arc<RetryExecutor>,
        record_retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            executor,
            record_retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Upsert `records`, isolating failures per record.
    pub async fn upsert(&self, records: &[Record]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            total: records.len(),
            ..BatchOutcome::default()
        };
        if records.is_empty() {
            return outcome;
        }

        match self.store.upsert_batch(records).await {
            Ok(()) => {
                outcome.success = records.len();
                return outcome;
            }
            Err(err) => {
                tracing::warn!(
                    records = records.len(),
                    error_type = %err.error_type(),
                    error = %err,
                    "bulk upsert failed, applying records individually"
                );
                outcome.used_fallback = true;
            }
        }

        for record in records {
            let context = format!("upsert {}", record.key);
            let store = &self.store;
            match self
                .executor
                .run(&context, &self.record_retry, || store.upsert(record))
                .await
            {
                Ok(()) => outcome.success += 1,
                Err(exhausted) => outcome.record(RecordFailure {
                    record_key: record.key.clone(),
                    error_type: exhausted.error_type,
                    message: exhausted.error.to_string(),
                    retry_count: exhausted.retry_count(),
                }),
            }
        }

        tracing::info!(
            total = outcome.total,
            success = outcome.success,
            failed = outcome.failed,
            "per-record upsert finished"
        );
        outcome
    }

    /// Delete `keys`, isolating failures per key.
    pub async fn delete(&self, keys: &[RecordKey]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            total: keys.len(),
            ..BatchOutcome::default()
        };
        if keys.is_empty() {
            return outcome;
        }

        match self.store.delete_batch(keys).await {
            Ok(()) => {
                outcome.success = keys.len();
                return outcome;
            }
            Err(err) => {
                tracing::warn!(
                    keys = keys.len(),
                    error_type = %err.error_type(),
                    error = %err,
                    "bulk delete failed, deleting keys individually"
                );
                outcome.used_fallback = true;
            }
        }

        for key in keys {
            let context = format!("delete {key}");
            let store = &self.store;
            match self
                .executor
                .run(&context, &self.record_retry, || store.delete(key))
                .await
            {
                Ok(()) => outcome.success += 1,
                Err(exhausted) => outcome.record(RecordFailure {
                    record_key: key.clone(),
                    error_type: exhausted.error_type,
                    message: exhausted.error.to_string(),
                    retry_count: exhausted.retry_count(),
                }),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use rowsync_core::Snapshot;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Store whose bulk calls always fail and whose single-record calls fail
    /// for selected keys.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        poison: HashMap<String, StoreError>,
        calls: Mutex<HashMap<String, u32>>,
        bulk_calls: AtomicU32,
    }

    impl FlakyStore {
        fn poisoned(keys: &[(&str, StoreError)]) -> Self {
            Self {
                poison: keys
                    .iter()
                    .map(|(k, e)| (k.to_string(), e.clone()))
                    .collect(),
                ..Self::default()
            }
        }

        fn calls_for(&self, key: &str) -> u32 {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }

        fn check(&self, key: &RecordKey) -> Result<(), StoreError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default() += 1;
            match self.poison.get(key.as_str()) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn load_all(&self) -> Result<Snapshot, StoreError> {
            self.inner.load_all().await
        }

        async fn upsert_batch(&self, _records: &[Record]) -> Result<(), StoreError> {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::new("batch rejected"))
        }

        async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
            self.check(&record.key)?;
            self.inner.upsert(record).await
        }

        async fn delete_batch(&self, _keys: &[RecordKey]) -> Result<(), StoreError> {
            Err(StoreError::new("batch rejected"))
        }

        async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.delete(key).await
        }
    }

    fn records(n: usize) -> Vec<Record> {
        (1..=n)
            .map(|i| Record::from_key(i.to_string()).with_field("n", i as u64))
            .collect()
    }

    fn applier(store: Arc<FlakyStore>) -> BatchApplier {
        BatchApplier::new(store, Arc::new(RetryExecutor::new()), RetryConfig::RECORD)
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn two_transient_failures_out_of_five_is_partial() {
        let store = Arc::new(FlakyStore::poisoned(&[
            ("2", StoreError::new("connection reset by peer")),
            ("4", StoreError::with_code("429", "too many requests")),
        ]));
        let outcome = applier(store.clone()).upsert(&records(5)).await;

        assert_eq!(outcome.status(), SyncStatus::Partial);
        assert_eq!(outcome.success, 3);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.transient_errors, 2);
        assert_eq!(outcome.permanent_errors, 0);
        assert_eq!(outcome.validation_errors, 0);
        assert!(outcome.used_fallback);

        // Transient records use the whole per-record budget.
        let budget = RetryConfig::RECORD.max_retries + 1;
        assert_eq!(store.calls_for("2"), budget);
        assert_eq!(outcome.errors[0].retry_count, RetryConfig::RECORD.max_retries);
        assert_eq!(store.calls_for("1"), 1);
        assert_eq!(store.inner.len().await, 3);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn permanent_failures_are_not_retried() {
        let store = Arc::new(FlakyStore::poisoned(&[
            ("1", StoreError::with_code("23505", "duplicate key value")),
            ("2", StoreError::with_code("401", "unauthorized")),
        ]));
        let outcome = applier(store.clone()).upsert(&records(3)).await;

        assert_eq!(store.calls_for("1"), 1);
        assert_eq!(store.calls_for("2"), 1);
        assert_eq!(outcome.validation_errors, 1);
        assert_eq!(outcome.permanent_errors, 1);
        assert_eq!(outcome.errors[0].retry_count, 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn all_failed_is_failed_status() {
        let store = Arc::new(FlakyStore::poisoned(&[
            ("1", StoreError::new("ETIMEDOUT")),
            ("2", StoreError::new("ETIMEDOUT")),
        ]));
        let outcome = applier(store).upsert(&records(2)).await;
        assert_eq!(outcome.status(), SyncStatus::Failed);
        assert!(outcome.is_total_transient_failure());
    }

    #[tokio::test]
    async fn successful_bulk_skips_fallback() {
        let store = Arc::new(MemoryStore::new());
        let applier = BatchApplier::new(
            store.clone(),
            Arc::new(RetryExecutor::new()),
            RetryConfig::RECORD,
        );
        let outcome = applier.upsert(&records(4)).await;
        assert_eq!(outcome.status(), SyncStatus::Completed);
        assert!(!outcome.used_fallback);
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn empty_batch_is_completed_without_store_calls() {
        let store = Arc::new(FlakyStore::default());
        let outcome = applier(store.clone()).upsert(&[]).await;
        assert_eq!(outcome.status(), SyncStatus::Completed);
        assert_eq!(store.bulk_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn deletes_fall_back_per_key() {
        let store = Arc::new(FlakyStore::poisoned(&[(
            "2",
            StoreError::with_code("42501", "permission denied for table listings"),
        )]));
        let keys: Vec<RecordKey> = ["1", "2"].into_iter().map(RecordKey::from).collect();
        let outcome = applier(store).delete(&keys).await;
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.permanent_errors, 1);
        assert_eq!(outcome.errors[0].error_type, ErrorType::Permission);
    }
}
