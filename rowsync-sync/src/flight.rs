//! Single-flight guards.
//!
//! At most one sync run may be active per guard. Acquisition never waits: a
//! caller that loses the race gets `None` and is expected to drop its trigger.
//! The returned [`FlightPermit`] releases the guard when dropped, so every
//! exit path of a run (success, error, timeout, panic unwind) frees it.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::error::{io_err, SyncError};
use crate::persist;

pub trait FlightGuard: Send + Sync + fmt::Debug {
    /// Take the guard if nobody holds it.
    fn try_acquire(&self) -> Result<Option<FlightPermit>, SyncError>;

    /// Whether a run currently holds the guard.
    fn is_held(&self) -> bool;
}

/// Proof of holding a guard. Releases on drop.
pub struct FlightPermit {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl FlightPermit {
    fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl fmt::Debug for FlightPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightPermit")
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ---------------------------------------------------------------------------
// LocalFlight
// ---------------------------------------------------------------------------

/// Process-local flag.
#[derive(Debug, Default, Clone)]
pub struct LocalFlight {
    busy: Arc<AtomicBool>,
}

impl LocalFlight {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlightGuard for LocalFlight {
    fn try_acquire(&self) -> Result<Option<FlightPermit>, SyncError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let busy = self.busy.clone();
        Ok(Some(FlightPermit::new(move || {
            busy.store(false, Ordering::Release);
        })))
    }

    fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// FileLease
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseBody {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Lease file shared by every process pointed at the same home directory.
///
/// Acquisition is a create-new write, which the filesystem makes atomic. A
/// lease whose expiry has passed belongs to a crashed holder and may be taken
/// over: the stale file is renamed aside and only discarded if it is still the
/// lease that was judged expired. The lease TTL must exceed the per-run
/// timeout.
#[derive(Debug, Clone)]
pub struct FileLease {
    path: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl FileLease {
    pub fn new(path: impl Into<PathBuf>, ttl: std::time::Duration) -> Self {
        Self::with_clock(path, ttl, clock::system())
    }

    pub fn with_clock(
        path: impl Into<PathBuf>,
        ttl: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: path.into(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(1)),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_body(&self) -> Result<Option<LeaseBody>, SyncError> {
        read_lease(&self.path)
    }

    /// Move the expired lease `seen` out of the way. Returns false when the
    /// file changed hands since it was read; the newer lease is put back.
    fn evict(&self, seen: Option<&LeaseBody>, attempt: &str) -> Result<bool, SyncError> {
        let tombstone = self.path.with_extension(format!("lease.{attempt}.stale"));
        match std::fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            // Evicted by someone else already; create-new decides the winner.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(io_err(&self.path, err)),
        }

        let moved = read_lease(&tombstone)?;
        let unchanged = moved.as_ref().map(|b| &b.holder) == seen.map(|b| &b.holder);
        if !unchanged {
            match std::fs::hard_link(&tombstone, &self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!(path = %self.path.display(), "lease replaced while restoring it");
                }
                Err(err) => return Err(io_err(&self.path, err)),
            }
        }
        persist::remove_if_exists(&tombstone)?;
        Ok(unchanged)
    }

    fn try_create(&self, body: &LeaseBody) -> Result<bool, SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        let bytes = serde_json::to_vec(body)?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_err(&self.path, e))?;
        Ok(true)
    }

    fn permit(&self, holder: String) -> FlightPermit {
        let path = self.path.clone();
        FlightPermit::new(move || release_lease(&path, &holder))
    }
}

fn read_lease(path: &Path) -> Result<Option<LeaseBody>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(body) => Ok(Some(body)),
            // Half-written by a crashed holder.
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable lease file");
                Ok(None)
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn release_lease(path: &Path, holder: &str) {
    // Only remove the file if it is still ours; an expired lease may have
    // been taken over in the meantime.
    let ours = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<LeaseBody>(&raw).ok())
        .is_some_and(|body| body.holder == holder);
    if !ours {
        tracing::warn!(path = %path.display(), "lease lost before release");
        return;
    }
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to release lease");
        }
    }
}

impl FlightGuard for FileLease {
    fn try_acquire(&self) -> Result<Option<FlightPermit>, SyncError> {
        let now = self.clock.now();
        let body = LeaseBody {
            holder: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };

        if self.try_create(&body)? {
            return Ok(Some(self.permit(body.holder)));
        }

        let seen = self.read_body()?;
        match &seen {
            Some(current) if current.expires_at > now => {
                tracing::debug!(holder = %current.holder, pid = current.pid, "lease held elsewhere");
                return Ok(None);
            }
            Some(current) => {
                tracing::warn!(
                    holder = %current.holder,
                    pid = current.pid,
                    expired_at = %current.expires_at,
                    "taking over expired lease"
                );
            }
            None => {}
        }

        if !self.evict(seen.as_ref(), &body.holder)? {
            tracing::debug!("lease changed hands during takeover");
            return Ok(None);
        }
        // Another process may win the retake; that is a normal lost race.
        if self.try_create(&body)? {
            Ok(Some(self.permit(body.holder)))
        } else {
            Ok(None)
        }
    }

    fn is_held(&self) -> bool {
        matches!(self.read_body(), Ok(Some(body)) if body.expires_at > self.clock.now())
    }
}
