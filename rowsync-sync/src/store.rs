//! Authoritative record store.
//!
//! Implementations must upsert on the business key and report failures as
//! [`StoreError`] with a `code` where one exists, so the classifier can tell
//! a constraint violation from an outage.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use rowsync_core::{Record, RecordKey, Snapshot};

use crate::error::{StoreError, SyncError};
use crate::persist;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current contents, ordered by key.
    async fn load_all(&self) -> Result<Snapshot, StoreError>;

    /// Upsert every record or none of them.
    async fn upsert_batch(&self, records: &[Record]) -> Result<(), StoreError>;

    async fn upsert(&self, record: &Record) -> Result<(), StoreError>;

    /// Delete every key or none of them. Missing keys are not an error.
    async fn delete_batch(&self, keys: &[RecordKey]) -> Result<(), StoreError>;

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError>;
}

/// Checks shared by the bundled stores.
fn validate_record(record: &Record) -> Result<(), StoreError> {
    if record.key.as_str().trim().is_empty() {
        return Err(StoreError::with_code(
            "22P02",
            "validation failed: record key is required",
        ));
    }
    Ok(())
}

fn validate_batch(records: &[Record]) -> Result<(), StoreError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        validate_record(record)?;
        if !seen.insert(&record.key) {
            return Err(StoreError::with_code(
                "23505",
                format!("duplicate key `{}` in batch", record.key),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<RecordKey, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            rows: Mutex::new(records.into_iter().map(|r| (r.key.clone(), r)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn get(&self, key: &RecordKey) -> Option<Record> {
        self.rows.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_all(&self) -> Result<Snapshot, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }

    async fn upsert_batch(&self, records: &[Record]) -> Result<(), StoreError> {
        validate_batch(records)?;
        let mut rows = self.rows.lock().await;
        for record in records {
            rows.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }

    async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        validate_record(record)?;
        self.rows
            .lock()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn delete_batch(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        for key in keys {
            rows.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.rows.lock().await.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    records: BTreeMap<RecordKey, Record>,
}

/// Keyed JSON document written atomically on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        persist::load_json::<StoreDocument>(&self.path)
            .map(Option::unwrap_or_default)
            .map_err(store_err)
    }

    fn save(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        persist::save_json(&self.path, doc).map_err(store_err)
    }

    async fn mutate(
        &self,
        apply: impl FnOnce(&mut StoreDocument) -> Result<(), StoreError> + Send,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        apply(&mut doc)?;
        self.save(&doc)
    }
}

fn store_err(err: SyncError) -> StoreError {
    let code = match &err {
        SyncError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => {
            Some("42501".to_string())
        }
        SyncError::Json(_) => Some("22P02".to_string()),
        _ => None,
    };
    StoreError {
        code,
        message: err.to_string(),
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load_all(&self) -> Result<Snapshot, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.records.into_values().collect())
    }

    async fn upsert_batch(&self, records: &[Record]) -> Result<(), StoreError> {
        validate_batch(records)?;
        self.mutate(|doc| {
            for record in records {
                doc.records.insert(record.key.clone(), record.clone());
            }
            Ok(())
        })
        .await
    }

    async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        validate_record(record)?;
        self.mutate(|doc| {
            doc.records.insert(record.key.clone(), record.clone());
            Ok(())
        })
        .await
    }

    async fn delete_batch(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        self.mutate(|doc| {
            for key in keys {
                doc.records.remove(key);
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.records.remove(key);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Classify;
    use rowsync_core::ErrorType;
    use tempfile::TempDir;

    fn rec(key: &str, price: i64) -> Record {
        Record::from_key(key).with_field("price", price)
    }

    #[tokio::test]
    async fn memory_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let err = store
            .upsert_batch(&[rec("1", 10), rec("", 20), rec("3", 30)])
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Validation);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_keys_in_batch_are_integrity_errors() {
        let store = MemoryStore::new();
        let err = store
            .upsert_batch(&[rec("1", 10), rec("1", 11)])
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::DataIntegrity);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = JsonFileStore::new(&path);
            store.upsert_batch(&[rec("b", 2), rec("a", 1)]).await.unwrap();
            store.delete(&RecordKey::from("b")).await.unwrap();
        }
        let reopened = JsonFileStore::new(&path);
        let snapshot = reopened.load_all().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records()[0], rec("a", 1));
    }

    #[tokio::test]
    async fn file_store_missing_document_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_missing_key_is_not_an_error() {
        let store = MemoryStore::with_records([rec("1", 1)]);
        store
            .delete_batch(&[RecordKey::from("1"), RecordKey::from("nope")])
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }
}
