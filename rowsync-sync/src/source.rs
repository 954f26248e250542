//! External source of truth.
//!
//! The spreadsheet itself is reached through a client that is out of scope
//! here; what the pipeline consumes is [`SnapshotSource`]. [`JsonFileSource`]
//! reads a sheet export: a JSON array of row objects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use rowsync_core::{Record, RecordKey};

use crate::error::SourceError;

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Every row, already normalised into records.
    async fn read_all(&self) -> Result<Vec<Record>, SourceError>;

    /// Up to `n` non-empty values of `column`, in row order.
    async fn read_sample(&self, column: &str, n: usize) -> Result<Vec<String>, SourceError>;
}

/// Sheet export on disk.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    key_column: String,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>, key_column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key_column: key_column.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_rows(&self) -> Result<Vec<serde_json::Map<String, Value>>, SourceError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|err| SourceError {
            code: io_code(&err),
            message: format!("failed to read {}: {err}", self.path.display()),
        })?;
        let parsed: Value = serde_json::from_str(&contents).map_err(|err| {
            SourceError::new(format!(
                "malformed source JSON in {}: {err}",
                self.path.display()
            ))
        })?;
        let Value::Array(rows) = parsed else {
            return Err(SourceError::new(format!(
                "malformed source JSON in {}: expected an array of rows",
                self.path.display()
            )));
        };

        let mut objects = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            match row {
                Value::Object(map) => objects.push(map),
                other => tracing::warn!(
                    row = index,
                    kind = value_kind(&other),
                    "skipping non-object row"
                ),
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl SnapshotSource for JsonFileSource {
    async fn read_all(&self) -> Result<Vec<Record>, SourceError> {
        let rows = self.read_rows()?;
        let mut records = Vec::with_capacity(rows.len());
        for (index, mut row) in rows.into_iter().enumerate() {
            let Some(key) = row.remove(&self.key_column).and_then(|v| cell_text(&v)) else {
                tracing::warn!(row = index, column = %self.key_column, "skipping row without key");
                continue;
            };
            let fields: BTreeMap<String, Value> = row.into_iter().collect();
            records.push(Record::new(RecordKey::from(key), fields));
        }
        tracing::debug!(path = %self.path.display(), rows = records.len(), "source read");
        Ok(records)
    }

    async fn read_sample(&self, column: &str, n: usize) -> Result<Vec<String>, SourceError> {
        Ok(self
            .read_rows()?
            .iter()
            .filter_map(|row| row.get(column).and_then(cell_text))
            .take(n)
            .collect())
    }
}

/// Text of a scalar cell; empty strings and non-scalars count as blank.
fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Map I/O failures onto codes the classifier understands.
fn io_code(err: &std::io::Error) -> Option<String> {
    use std::io::ErrorKind;
    let code = match err.kind() {
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::ConnectionReset => "ECONNRESET",
        ErrorKind::PermissionDenied => "42501",
        _ => return None,
    };
    Some(code.to_string())
}
