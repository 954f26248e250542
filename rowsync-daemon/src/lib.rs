//! Rowsync daemon: poll timer, source watcher, sync processor and a
//! control socket around one shared [`rowsync_sync::SyncOrchestrator`].

mod error;
pub mod log_rotation;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_metrics, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking, Trigger, DEBOUNCE_WINDOW};
