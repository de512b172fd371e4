//! File-backed queue store.
//!
//! The queue is persisted as a JSON envelope carrying a schema version and
//! a SHA-256 checksum of the payload. Every mutation:
//!
//! 1. re-reads and validates the current file (another process may have
//!    written since — all writers hold the queue lock, readers may not),
//! 2. copies the current file to a timestamped backup,
//! 3. stages the new content to a temp file in the same directory,
//!    re-parses it as a validation step, fsyncs, and
//! 4. atomically renames it over the store path.
//!
//! A reader therefore never observes a partially written store. If
//! validation fails on load, the newest valid backup is swapped in and the
//! operation aborts with [`StoreError::Corruption`] so the caller can retry;
//! with no valid backup the store is reinitialized empty (in-flight queue
//! state is lost, trunk is not).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::request::MergeRequest;
use crate::model::types::{BranchRef, RequestId, SessionId};

use super::{EnqueueOutcome, QueueDocument, QueueStore, StatusUpdate, StoreError};

/// Current schema version of the persisted envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// How many timestamped backups to retain by default.
pub const DEFAULT_BACKUPS_RETAINED: usize = 5;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The on-disk wrapper around [`QueueDocument`].
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Schema version; readers reject versions they do not understand.
    version: u32,
    /// Lowercase hex SHA-256 of the compact-JSON `queue` payload.
    checksum: String,
    /// The queue itself.
    queue: QueueDocument,
}

fn payload_checksum(queue: &QueueDocument) -> Result<String, StoreError> {
    let payload =
        serde_json::to_string(queue).map_err(|e| StoreError::Serialize(e.to_string()))?;
    let digest = Sha256::digest(payload.as_bytes());
    Ok(format!("{digest:x}"))
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Queue store persisted to a single JSON file (`.mergeq/queue.json`).
pub struct FileStore {
    path: PathBuf,
    backups_retained: usize,
}

impl FileStore {
    /// Create a store over `path`. The file is created lazily on first
    /// mutation.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            backups_retained: DEFAULT_BACKUPS_RETAINED,
        }
    }

    /// Override the backup retention count.
    #[must_use]
    pub const fn with_backups_retained(mut self, count: usize) -> Self {
        self.backups_retained = count;
        self
    }

    /// The store file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort unlocked snapshot read for status display.
    ///
    /// Skips corruption recovery: a corrupt file surfaces as an error, but
    /// nothing is mutated.
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the file exists but cannot be read or
    /// fails validation.
    pub fn snapshot(path: &Path) -> Result<QueueDocument, StoreError> {
        if !path.exists() {
            return Ok(QueueDocument::new());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| StoreError::Io(format!("read {}: {e}", path.display())))?;
        Self::validate(path, &raw)
    }

    /// Parse and validate envelope content.
    fn validate(path: &Path, raw: &str) -> Result<QueueDocument, StoreError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(|e| StoreError::Corruption {
            path: path.to_owned(),
            detail: format!("malformed JSON: {e}"),
            restored: false,
        })?;
        if envelope.version != SCHEMA_VERSION {
            return Err(StoreError::Corruption {
                path: path.to_owned(),
                detail: format!(
                    "unsupported schema version {} (expected {SCHEMA_VERSION})",
                    envelope.version
                ),
                restored: false,
            });
        }
        let expected = payload_checksum(&envelope.queue)?;
        if envelope.checksum != expected {
            return Err(StoreError::Corruption {
                path: path.to_owned(),
                detail: "checksum mismatch".to_owned(),
                restored: false,
            });
        }
        Ok(envelope.queue)
    }

    /// Load the document, attempting backup restore on corruption.
    fn load(&self) -> Result<QueueDocument, StoreError> {
        if !self.path.exists() {
            return Ok(QueueDocument::new());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Io(format!("read {}: {e}", self.path.display())))?;
        match Self::validate(&self.path, &raw) {
            Ok(doc) => Ok(doc),
            Err(StoreError::Corruption { detail, .. }) => self.recover(&detail),
            Err(e) => Err(e),
        }
    }

    /// Swap in the newest valid backup, or reinitialize empty.
    ///
    /// Always returns `Err(Corruption)` — the in-progress operation is
    /// aborted so the caller retries against the recovered store.
    fn recover(&self, detail: &str) -> Result<QueueDocument, StoreError> {
        warn!(path = %self.path.display(), detail, "queue store corrupt, attempting backup restore");
        for backup in self.backups_newest_first() {
            let Ok(raw) = fs::read_to_string(&backup) else {
                continue;
            };
            if let Ok(doc) = Self::validate(&backup, &raw) {
                self.write_atomic(&doc)?;
                warn!(backup = %backup.display(), "restored queue store from backup");
                return Err(StoreError::Corruption {
                    path: self.path.clone(),
                    detail: detail.to_owned(),
                    restored: true,
                });
            }
        }
        self.write_atomic(&QueueDocument::new())?;
        warn!("no valid backup found; queue store reinitialized empty");
        Err(StoreError::Corruption {
            path: self.path.clone(),
            detail: detail.to_owned(),
            restored: false,
        })
    }

    /// Write the document atomically: stage to a temp file in the same
    /// directory, re-parse the staged bytes as validation, fsync, rename.
    fn write_atomic(&self, doc: &QueueDocument) -> Result<(), StoreError> {
        let envelope = Envelope {
            version: SCHEMA_VERSION,
            checksum: payload_checksum(doc)?,
            queue: doc.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        let dir = self.path.parent().ok_or_else(|| {
            StoreError::Io(format!("no parent directory for {}", self.path.display()))
        })?;
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| StoreError::Io(format!("stage in {}: {e}", dir.display())))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| StoreError::Io(format!("write staged store: {e}")))?;

        // Validate the staged content before committing it.
        Self::validate(tmp.path(), &json)?;

        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::Io(format!("fsync staged store: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(format!("rename into {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Copy the current store file to a timestamped backup and prune old
    /// ones.
    fn backup_current(&self) -> Result<(), StoreError> {
        if !self.path.exists() {
            return Ok(());
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let backup = self.backup_path(ts);
        fs::copy(&self.path, &backup)
            .map_err(|e| StoreError::Io(format!("backup to {}: {e}", backup.display())))?;
        debug!(backup = %backup.display(), "queue store backed up");

        let backups = self.backups_newest_first();
        for stale in backups.iter().skip(self.backups_retained) {
            if let Err(e) = fs::remove_file(stale) {
                warn!(path = %stale.display(), error = %e, "failed to prune old backup");
            }
        }
        Ok(())
    }

    fn backup_path(&self, ts: u128) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "queue.json".to_owned(), |n| n.to_string_lossy().into_owned());
        self.path.with_file_name(format!("{name}.bak.{ts}"))
    }

    /// All backup files for this store, newest first.
    fn backups_newest_first(&self) -> Vec<PathBuf> {
        let Some(dir) = self.path.parent() else {
            return Vec::new();
        };
        let prefix = self.path.file_name().map_or_else(
            || "queue.json.bak.".to_owned(),
            |n| format!("{}.bak.", n.to_string_lossy()),
        );
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut found: Vec<(u128, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                let ts: u128 = name.strip_prefix(&prefix)?.parse().ok()?;
                Some((ts, e.path()))
            })
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, p)| p).collect()
    }

    /// Load-mutate-save cycle shared by all mutating operations.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut QueueDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut doc = self.load()?;
        let before = doc.clone();
        let out = op(&mut doc)?;
        if doc != before {
            self.backup_current()?;
            self.write_atomic(&doc)?;
        }
        Ok(out)
    }
}

impl QueueStore for FileStore {
    fn enqueue(
        &mut self,
        request_id: RequestId,
        source_ref: BranchRef,
        target_ref: BranchRef,
        origin_id: SessionId,
        now: u64,
    ) -> Result<EnqueueOutcome, StoreError> {
        self.mutate(|doc| Ok(doc.enqueue(request_id, source_ref, target_ref, origin_id, now)))
    }

    fn next_eligible(&mut self) -> Result<Option<MergeRequest>, StoreError> {
        Ok(self.load()?.next_eligible().cloned())
    }

    fn apply(
        &mut self,
        request_id: RequestId,
        update: StatusUpdate,
    ) -> Result<MergeRequest, StoreError> {
        self.mutate(|doc| doc.apply(request_id, update))
    }

    fn remove(&mut self, request_id: RequestId) -> Result<MergeRequest, StoreError> {
        self.mutate(|doc| doc.remove(request_id))
    }

    fn list(&mut self) -> Result<Vec<MergeRequest>, StoreError> {
        Ok(self.load()?.entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
