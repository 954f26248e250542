//! Daemon log files and their size-based rotation.
//!
//! Every event goes to `daemon.log`; warnings and errors are also copied to
//! `daemon-err.log`. Rotation shifts `daemon.log` → `daemon.log.1` → … →
//! `daemon.log.<max_files>`; the oldest copy falls off the end.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::fmt::writer::{MakeWriter, MakeWriterExt};

use rowsync_core::paths::{stderr_log_path, stdout_log_path};

/// Appends to a log file, reopening it for every event so a rotated file is
/// never written to after the rename.
#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// One event's handle. A file that cannot be opened swallows the event.
pub struct LogFileWriter(Option<File>);

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .ok(),
        )
    }
}

/// Writer for both daemon log files under `home`.
pub fn daemon_log_writer(home: &Path) -> impl for<'a> MakeWriter<'a> + Send + Sync + 'static {
    LogFile::new(stdout_log_path(home))
        .and(LogFile::new(stderr_log_path(home)).with_max_level(Level::WARN))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for RotationPolicy {
    /// 10 MiB per file, five backups.
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log_path` once it reaches `max_bytes`. Returns whether a
    /// rotation happened; a missing file is not an error.
    pub fn rotate_if_needed(&self, log_path: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log_path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes || self.max_files == 0 {
            return Ok(false);
        }

        remove_if_present(&backup_path(log_path, self.max_files))?;
        for n in (1..self.max_files).rev() {
            let from = backup_path(log_path, n);
            if from.exists() {
                fs::rename(&from, backup_path(log_path, n + 1))?;
            }
        }
        fs::rename(log_path, backup_path(log_path, 1))?;

        // Keep the file present for `daemon logs` until the next event.
        fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(log_path)?;
        Ok(true)
    }
}

/// Rotate both log files under `home`. Returns how many were rotated;
/// a failure on one file is logged and does not block the other.
pub fn rotate_logs(home: &Path, policy: &RotationPolicy) -> usize {
    let mut rotated = 0;
    for log_path in [stdout_log_path(home), stderr_log_path(home)] {
        match policy.rotate_if_needed(&log_path) {
            Ok(true) => {
                rotated += 1;
                tracing::info!(path = %log_path.display(), "log file rotated");
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
    rotated
}

/// `daemon.log` + 2 → `daemon.log.2`.
pub fn backup_path(base: &Path, n: usize) -> PathBuf {
    let mut name = base.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    base.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
