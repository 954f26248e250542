//! Atomic JSON persistence shared by the file-backed cache, store, tracker
//! and metrics.
//!
//! Writes go to `<path>.tmp` and are renamed into place, so a crash never
//! leaves a half-written document behind.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{io_err, SyncError};

/// Load a JSON document, or `None` when the file does not exist.
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SyncError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Save a JSON document atomically, creating parent directories.
pub(crate) fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SyncError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("path has no parent directory"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, &json)
}

fn write_atomic(path: &Path, json: &str) -> Result<(), SyncError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// [`load_json`] on the blocking pool.
pub(crate) async fn load_json_off_thread<T>(path: PathBuf) -> Result<Option<T>, SyncError>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::task::spawn_blocking(move || load_json(&path))
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}

/// Serialize on the caller, then write on the blocking pool.
pub(crate) async fn save_json_off_thread<T>(path: PathBuf, value: &T) -> Result<(), SyncError>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_string_pretty(value)?;
    tokio::task::spawn_blocking(move || {
        let Some(dir) = path.parent() else {
            return Err(io_err(
                &path,
                std::io::Error::other("path has no parent directory"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        write_atomic(&path, &json)
    })
    .await
    .map_err(|e| SyncError::Task(e.to_string()))?
}

/// Remove a file, treating "already gone" as success. Returns whether a file
/// was actually removed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let loaded: Option<HashMap<String, String>> =
            load_json(&tmp.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn save_creates_parents_and_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("runs.json");
        let mut doc = HashMap::new();
        doc.insert("a".to_string(), "b".to_string());

        save_json(&path, &doc).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded: HashMap<String, String> = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn corrupt_document_is_a_json_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json::<HashMap<String, String>>(&path).unwrap_err();
        assert!(matches!(err, SyncError::Json(_)));
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
