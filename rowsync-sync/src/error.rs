//! Error types for rowsync-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use rowsync_core::{classify, ConfigError, ErrorType, SyncId, SyncStatus};

/// Anything that can be mapped onto the failure taxonomy.
pub trait Classify {
    fn error_type(&self) -> ErrorType;
}

/// Failure reported by the external source client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SourceError {
    /// HTTP status or client error code, when the client exposes one.
    pub code: Option<String>,
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl Classify for SourceError {
    fn error_type(&self) -> ErrorType {
        classify(self.code.as_deref(), &self.message)
    }
}

/// Structured failure reported by the record store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    /// SQL state or driver code, when available.
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl Classify for StoreError {
    fn error_type(&self) -> ErrorType {
        classify(self.code.as_deref(), &self.message)
    }
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid glob pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("sync run timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("sync {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SyncId,
        from: SyncStatus,
        to: SyncStatus,
    },

    #[error("unknown sync run {0}")]
    UnknownSync(SyncId),

    #[error("lease error: {0}")]
    Lease(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Machine code carried by collaborator errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            SyncError::Source(err) => err.code.as_deref(),
            SyncError::Store(err) => err.code.as_deref(),
            _ => None,
        }
    }
}

impl Classify for SyncError {
    fn error_type(&self) -> ErrorType {
        match self {
            SyncError::Source(err) => err.error_type(),
            SyncError::Store(err) => err.error_type(),
            SyncError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorType::Network,
                std::io::ErrorKind::PermissionDenied => ErrorType::Permission,
                _ => classify(None, &source.to_string()),
            },
            SyncError::Timeout { .. } => ErrorType::Network,
            SyncError::Json(_) | SyncError::Config(_) | SyncError::Pattern { .. } => {
                ErrorType::Validation
            }
            SyncError::InvalidTransition { .. }
            | SyncError::UnknownSync(_)
            | SyncError::Lease(_)
            | SyncError::Task(_) => ErrorType::Unknown,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
