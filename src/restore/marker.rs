// restoretool/src/restore/marker.rs
//! Durable "this database has been restored" records.
//!
//! Markers live in the server's persistent data directory so they survive
//! container restarts. A run holds an exclusive advisory lock for its whole
//! duration, which turns the marker's check-then-act into a single claim.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub database: String,
    pub backup: String,
    pub has_hypertables: bool,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: &Path) -> Self {
        MarkerStore {
            dir: dir.to_path_buf(),
        }
    }

    pub fn marker_path(&self, database: &str) -> PathBuf {
        self.dir.join(format!(".restored_{}", file_key(database)))
    }

    pub fn lock_path(&self, database: &str) -> PathBuf {
        self.dir.join(format!(".restore_{}.lock", file_key(database)))
    }

    pub fn exists(&self, database: &str) -> bool {
        self.marker_path(database).is_file()
    }

    /// Reads the marker; a marker from an older layout (empty or not JSON) reads as `None`
    /// while still counting for [`MarkerStore::exists`].
    pub fn read(&self, database: &str) -> Result<Option<MarkerRecord>> {
        let path = self.marker_path(database);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read marker {}", path.display()));
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Marker {} is not a JSON record: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Writes the marker atomically: a temp file in the same directory, then a rename.
    pub fn write(&self, record: &MarkerRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create marker directory {}", self.dir.display()))?;
        let path = self.marker_path(&record.database);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, record).context("Failed to serialise marker")?;
        tmp.as_file_mut().sync_all().context("Failed to flush marker")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to move marker into place at {}", path.display()))?;
        info!("✓ Restore marker written: {}", path.display());
        Ok(path)
    }

    pub fn remove(&self, database: &str) -> Result<bool> {
        let path = self.marker_path(database);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("🗑 Removed restore marker {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove marker {}", path.display())),
        }
    }

    /// Claims the database for this run.
    ///
    /// Takes an exclusive advisory lock on a persistent lock file. The kernel
    /// drops the lock when the process exits, so a killed run never blocks the
    /// next one. Fails with [`AppError::RestoreInProgress`] while another live
    /// run holds it.
    pub fn lock(&self, database: &str) -> Result<RestoreLock> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create marker directory {}", self.dir.display()))?;
        let path = self.lock_path(database);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock {}", path.display()))?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(AppError::RestoreInProgress {
                    database: database.to_string(),
                    lock_path: path,
                }
                .into());
            }
            return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
        }

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("Failed to write lock {}", path.display()))?;
        debug!("Acquired restore lock {}", path.display());
        Ok(RestoreLock { file, path })
    }
}

/// Holds the advisory lock until dropped. The lock file itself stays in place.
#[derive(Debug)]
pub struct RestoreLock {
    file: File,
    path: PathBuf,
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release restore lock {}: {}", self.path.display(), e);
        }
    }
}

/// Maps a database name to a file-name-safe key, percent-encoding anything
/// outside `[A-Za-z0-9_-]` so distinct names never collide.
fn file_key(database: &str) -> String {
    let mut key = String::with_capacity(database.len());
    for byte in database.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            key.push(byte as char);
        } else {
            key.push_str(&format!("%{:02X}", byte));
        }
    }
    key
}
