//! On-disk snapshot ownership: the Parquet file, its sidecar metadata, and
//! the cross-process refresh lock.
//!
//! The store knows nothing about the network or the query engine; it only
//! guarantees the filesystem invariants the rest of the system leans on:
//! exactly one visible snapshot, metadata never ahead of it, and at most one
//! lock holder.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sidecar metadata describing the currently promoted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub sha256: String,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    pub size: i64,
}

/// Outcome of a lock acquisition attempt. `Busy` (another holder exists) is
/// deliberately distinct from an I/O error.
pub enum LockAttempt {
    Acquired(LockHandle),
    Busy,
}

/// Exclusive handle on the refresh lock. Dropping it without calling
/// [`SnapshotStore::release_lock`] leaves the file behind for `IGNORE_LOCK`
/// or the next holder's force-unlock to clean up.
pub struct LockHandle {
    file: Option<File>,
    path: PathBuf,
}

/// Owns the three well-known paths and every direct filesystem operation on
/// them.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshot_path: PathBuf,
    metadata_path: PathBuf,
    lock_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(snapshot_path: PathBuf, metadata_path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            snapshot_path,
            metadata_path,
            lock_path,
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn snapshot_exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    /// Reads the sidecar metadata. A missing or unreadable document is
    /// `None`: freshness checks treat it as "unknown, assume stale".
    pub fn read_metadata(&self) -> Option<Metadata> {
        let data = match fs::read(&self.metadata_path) {
            Ok(d) => d,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    debug!(path = %self.metadata_path.display(), error = %e, "metadata unreadable");
                }
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!(path = %self.metadata_path.display(), error = %e, "metadata corrupt");
                None
            }
        }
    }

    /// Writes the sidecar metadata whole, pretty-printed.
    pub fn write_metadata(&self, meta: &Metadata) -> Result<()> {
        ensure_parent(&self.metadata_path)?;
        let data = serde_json::to_vec_pretty(meta)?;
        fs::write(&self.metadata_path, data)
            .with_context(|| format!("failed to write {}", self.metadata_path.display()))?;
        Ok(())
    }

    /// Attempts an exclusive-create of the lock file.
    pub fn acquire_lock(&self) -> io::Result<LockAttempt> {
        ensure_parent(&self.lock_path).map_err(|e| io::Error::other(e.to_string()))?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => Ok(LockAttempt::Acquired(LockHandle {
                file: Some(file),
                path: self.lock_path.clone(),
            })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(LockAttempt::Busy),
            Err(e) => Err(e),
        }
    }

    /// Closes and unlinks the lock. Idempotent: a second release (or a
    /// release after `force_unlock`) is a no-op.
    pub fn release_lock(&self, mut handle: LockHandle) {
        handle.file.take();
        if let Err(e) = fs::remove_file(&handle.path) {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %handle.path.display(), error = %e, "failed to remove lock file");
            }
        }
    }

    /// Unlinks the lock regardless of holder. Only invoked when the
    /// `IGNORE_LOCK` override is enabled.
    pub fn force_unlock(&self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %self.lock_path.display(), error = %e, "force-unlock failed");
            }
        }
    }

    pub fn sha256_of_snapshot(&self) -> Result<String> {
        sha256_of_file(&self.snapshot_path)
    }

    /// Atomically replaces the snapshot with `temp_path`.
    ///
    /// `rename(2)` replaces the destination in a single step on Unix. If the
    /// temp file lives on another filesystem the rename fails; we then copy
    /// into a staging file next to the snapshot and rename that, so readers
    /// still see either the old or the new file.
    pub fn promote(&self, temp_path: &Path) -> Result<()> {
        ensure_parent(&self.snapshot_path)?;
        match fs::rename(temp_path, &self.snapshot_path) {
            Ok(()) => Ok(()),
            Err(_) => {
                let staging = self.snapshot_path.with_extension("staging");
                fs::copy(temp_path, &staging).with_context(|| {
                    format!("failed to stage snapshot at {}", staging.display())
                })?;
                fs::rename(&staging, &self.snapshot_path).with_context(|| {
                    format!("failed to promote {}", self.snapshot_path.display())
                })
            }
        }
    }
}

/// Streams a file through SHA-256 and returns the lowercase hex digest.
pub fn sha256_of_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}
