//! Queue store — the single source of truth for merge-request state.
//!
//! The store is defined as a trait so persistence is injectable: the
//! production path is the file-backed [`FileStore`] (atomic staged writes,
//! checksums, timestamped backups), while tests use the in-memory
//! [`MemStore`]. All the queue semantics — idempotent enqueue, FIFO
//! eligibility, transition validation — live in [`QueueDocument`] and are
//! shared by both.
//!
//! Every mutation must happen while holding the queue lock (see
//! [`crate::lock`]); the store itself does not enforce this.

pub mod file;
pub mod mem;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::request::{MergeRequest, RecordedError};
use crate::model::status::{RequestStatus, TransitionError};
use crate::model::types::{BranchRef, RequestId, SessionId};

pub use file::FileStore;
pub use mem::MemStore;

// ---------------------------------------------------------------------------
// QueueStore trait
// ---------------------------------------------------------------------------

/// Mutating and reading operations over the ordered queue of merge requests.
///
/// Methods take `&mut self` even for reads because the file-backed store
/// re-reads the backing file on every call — another process may have
/// mutated it since.
pub trait QueueStore {
    /// Add a request in state `queued`.
    ///
    /// Idempotent: if a non-terminal entry for `request_id` already exists,
    /// returns [`EnqueueOutcome::AlreadyQueued`] without touching the store.
    ///
    /// # Errors
    /// Returns a [`StoreError`] on persistence failure.
    fn enqueue(
        &mut self,
        request_id: RequestId,
        source_ref: BranchRef,
        target_ref: BranchRef,
        origin_id: SessionId,
        now: u64,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// The oldest entry in state `queued` (by sequence number), if any.
    ///
    /// # Errors
    /// Returns a [`StoreError`] on persistence failure.
    fn next_eligible(&mut self) -> Result<Option<MergeRequest>, StoreError>;

    /// Atomic read-modify-write of one non-terminal entry's status and
    /// bookkeeping fields. Rejects transitions the state machine does not
    /// permit. Returns the updated entry.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if no non-terminal entry matches,
    /// [`StoreError::InvalidTransition`] if the state machine rejects the
    /// change, or a persistence error.
    fn apply(
        &mut self,
        request_id: RequestId,
        update: StatusUpdate,
    ) -> Result<MergeRequest, StoreError>;

    /// Administrative removal of a terminal entry. Returns the removed
    /// entry.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if the id is unknown,
    /// [`StoreError::NotTerminal`] if the entry is still in flight.
    fn remove(&mut self, request_id: RequestId) -> Result<MergeRequest, StoreError>;

    /// All entries in sequence order (read-only).
    ///
    /// # Errors
    /// Returns a [`StoreError`] on persistence failure.
    fn list(&mut self) -> Result<Vec<MergeRequest>, StoreError>;
}

/// Result of an enqueue call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created with the given sequence number.
    Created {
        /// The assigned ordering key.
        seq: u64,
    },
    /// A non-terminal entry for this request id already exists; nothing was
    /// written. Not an error — producers deliver at-least-once.
    AlreadyQueued,
}

// ---------------------------------------------------------------------------
// StatusUpdate
// ---------------------------------------------------------------------------

/// A status transition plus the bookkeeping fields that change with it.
///
/// Built with the `with_*` methods; fields left unset keep their current
/// value on the entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    /// The target status.
    pub new_status: RequestStatus,
    /// Replace `retry_count`, if set.
    pub retry_count: Option<u32>,
    /// Replace `started_at`, if set (`Some(None)` clears it).
    pub started_at: Option<Option<u64>>,
    /// Replace `last_error`, if set.
    pub last_error: Option<Option<RecordedError>>,
    /// Replace `conflict_files`, if set.
    pub conflict_files: Option<Vec<String>>,
}

impl StatusUpdate {
    /// A bare transition to `status`.
    #[must_use]
    pub const fn to(status: RequestStatus) -> Self {
        Self {
            new_status: status,
            retry_count: None,
            started_at: None,
            last_error: None,
            conflict_files: None,
        }
    }

    /// Set `started_at` to `now`.
    #[must_use]
    pub const fn started(mut self, now: u64) -> Self {
        self.started_at = Some(Some(now));
        self
    }

    /// Clear `started_at` (used when re-admitting to the queue).
    #[must_use]
    pub const fn cleared_start(mut self) -> Self {
        self.started_at = Some(None);
        self
    }

    /// Set `retry_count`.
    #[must_use]
    pub const fn retries(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Record an error on the entry.
    #[must_use]
    pub fn error(mut self, err: RecordedError) -> Self {
        self.last_error = Some(Some(err));
        self
    }

    /// Record the conflicting file list from a conflict check.
    #[must_use]
    pub fn conflicts(mut self, files: Vec<String>) -> Self {
        self.conflict_files = Some(files);
        self
    }
}

// ---------------------------------------------------------------------------
// QueueDocument — shared queue semantics
// ---------------------------------------------------------------------------

/// The persisted queue: a monotonic sequence counter plus the ordered
/// entries. Pure data + logic; persistence lives in the store impls.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDocument {
    /// Next sequence number to assign.
    pub next_seq: u64,
    /// All entries, ascending by `seq`. Terminal entries are retained for
    /// audit until administratively removed.
    #[serde(default)]
    pub entries: Vec<MergeRequest>,
}

impl QueueDocument {
    /// An empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_seq: 1,
            entries: Vec::new(),
        }
    }

    /// Enqueue semantics shared by all stores. See
    /// [`QueueStore::enqueue`].
    pub fn enqueue(
        &mut self,
        request_id: RequestId,
        source_ref: BranchRef,
        target_ref: BranchRef,
        origin_id: SessionId,
        now: u64,
    ) -> EnqueueOutcome {
        if self
            .entries
            .iter()
            .any(|e| e.request_id == request_id && !e.status.is_terminal())
        {
            return EnqueueOutcome::AlreadyQueued;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(MergeRequest::new(
            seq, request_id, source_ref, target_ref, origin_id, now,
        ));
        EnqueueOutcome::Created { seq }
    }

    /// The oldest `queued` entry by sequence number.
    #[must_use]
    pub fn next_eligible(&self) -> Option<&MergeRequest> {
        self.entries
            .iter()
            .filter(|e| e.status == RequestStatus::Queued)
            .min_by_key(|e| e.seq)
    }

    /// Apply a [`StatusUpdate`] to the non-terminal entry for `request_id`.
    ///
    /// # Errors
    /// See [`QueueStore::apply`].
    pub fn apply(
        &mut self,
        request_id: RequestId,
        update: StatusUpdate,
    ) -> Result<MergeRequest, StoreError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.request_id == request_id && !e.status.is_terminal())
            .ok_or(StoreError::NotFound { request_id })?;

        if !entry.status.can_transition_to(update.new_status) {
            return Err(StoreError::InvalidTransition(TransitionError {
                from: entry.status,
                to: update.new_status,
            }));
        }

        entry.status = update.new_status;
        if let Some(count) = update.retry_count {
            entry.retry_count = count;
        }
        if let Some(started) = update.started_at {
            entry.started_at = started;
        }
        if let Some(err) = update.last_error {
            entry.last_error = err;
        }
        if let Some(files) = update.conflict_files {
            entry.conflict_files = files;
        }
        Ok(entry.clone())
    }

    /// Remove a terminal entry.
    ///
    /// # Errors
    /// See [`QueueStore::remove`].
    pub fn remove(&mut self, request_id: RequestId) -> Result<MergeRequest, StoreError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.request_id == request_id)
            .ok_or(StoreError::NotFound { request_id })?;
        if !self.entries[idx].status.is_terminal() {
            return Err(StoreError::NotTerminal {
                request_id,
                status: self.entries[idx].status,
            });
        }
        Ok(self.entries.remove(idx))
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from queue-store operations.
#[derive(Debug)]
pub enum StoreError {
    /// No non-terminal entry (or, for `remove`, no entry at all) matches the
    /// request id.
    NotFound {
        /// The id that was looked up.
        request_id: RequestId,
    },
    /// `remove` was called on an entry that is still in flight.
    NotTerminal {
        /// The id that was looked up.
        request_id: RequestId,
        /// Its current status.
        status: RequestStatus,
    },
    /// The state machine rejected the requested transition.
    InvalidTransition(TransitionError),
    /// The backing file failed validation. `restored` reports whether a
    /// valid backup was swapped in; either way the operation was aborted and
    /// should be retried on the next invocation.
    Corruption {
        /// Path of the corrupt store file.
        path: PathBuf,
        /// What failed to validate.
        detail: String,
        /// Whether a backup was restored (false = reinitialized empty).
        restored: bool,
    },
    /// Serialization failure.
    Serialize(String),
    /// I/O failure.
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { request_id } => {
                write!(
                    f,
                    "no active queue entry for request {request_id}.\n  To fix: check current entries:\n    mergeq status"
                )
            }
            Self::NotTerminal { request_id, status } => {
                write!(
                    f,
                    "request {request_id} is still {status}; only merged/failed/timeout entries can be removed.\n  To fix: wait for it to finish, or let the reaper time it out:\n    mergeq cleanup"
                )
            }
            Self::InvalidTransition(err) => write!(f, "{err}"),
            Self::Corruption {
                path,
                detail,
                restored,
            } => {
                write!(
                    f,
                    "queue store corrupt at {}: {detail}\n  {}",
                    path.display(),
                    if *restored {
                        "A backup was restored; retry the operation."
                    } else {
                        "No valid backup existed; the queue was reinitialized empty. In-flight state was lost."
                    }
                )
            }
            Self::Serialize(msg) => write!(f, "queue store serialize error: {msg}"),
            Self::Io(msg) => write!(f, "queue store I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<TransitionError> for StoreError {
    fn from(err: TransitionError) -> Self {
        Self::InvalidTransition(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn rid(n: u64) -> RequestId {
        RequestId::new(n).unwrap()
    }

    fn enqueue(doc: &mut QueueDocument, id: u64, now: u64) -> EnqueueOutcome {
        doc.enqueue(
            rid(id),
            BranchRef::new(&format!("feature/{id}")).unwrap(),
            BranchRef::new("main").unwrap(),
            SessionId::new("term-1").unwrap(),
            now,
        )
    }

    #[test]
    fn enqueue_assigns_monotonic_seq() {
        let mut doc = QueueDocument::new();
        assert_eq!(enqueue(&mut doc, 101, 1000), EnqueueOutcome::Created { seq: 1 });
        assert_eq!(enqueue(&mut doc, 102, 999), EnqueueOutcome::Created { seq: 2 });
        assert_eq!(doc.next_seq, 3);
    }

    #[test]
    fn enqueue_is_idempotent_for_active_entry() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        assert_eq!(enqueue(&mut doc, 101, 1001), EnqueueOutcome::AlreadyQueued);
        assert_eq!(doc.entries.len(), 1);
    }

    #[test]
    fn enqueue_allowed_again_after_terminal() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merging))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merged))
            .unwrap();
        // Terminal entry is retained, but a fresh one can be enqueued.
        assert!(matches!(
            enqueue(&mut doc, 101, 2000),
            EnqueueOutcome::Created { seq: 2 }
        ));
        assert_eq!(doc.entries.len(), 2);
    }

    #[test]
    fn next_eligible_is_fifo_by_seq() {
        let mut doc = QueueDocument::new();
        // Producer clocks are skewed: the later enqueue claims an earlier
        // timestamp. Sequence order must win.
        enqueue(&mut doc, 101, 5000);
        enqueue(&mut doc, 102, 1000);
        assert_eq!(doc.next_eligible().unwrap().request_id, rid(101));
    }

    #[test]
    fn next_eligible_skips_non_queued() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        enqueue(&mut doc, 102, 1001);
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap();
        assert_eq!(doc.next_eligible().unwrap().request_id, rid(102));
    }

    #[test]
    fn next_eligible_empty() {
        let doc = QueueDocument::new();
        assert!(doc.next_eligible().is_none());
    }

    #[test]
    fn retried_entry_keeps_original_seq_priority() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        enqueue(&mut doc, 102, 1001);
        doc.apply(
            rid(101),
            StatusUpdate::to(RequestStatus::ConflictCheck).started(1002),
        )
        .unwrap();
        doc.apply(
            rid(101),
            StatusUpdate::to(RequestStatus::ConflictDetected),
        )
        .unwrap();
        doc.apply(
            rid(101),
            StatusUpdate::to(RequestStatus::Queued)
                .retries(1)
                .cleared_start(),
        )
        .unwrap();
        // 101 re-queued with its original seq — still ahead of 102.
        assert_eq!(doc.next_eligible().unwrap().request_id, rid(101));
        let e = doc
            .entries
            .iter()
            .find(|e| e.request_id == rid(101))
            .unwrap();
        assert_eq!(e.seq, 1);
        assert_eq!(e.enqueued_at, 1000);
        assert_eq!(e.retry_count, 1);
        assert!(e.started_at.is_none());
    }

    #[test]
    fn apply_rejects_invalid_transition() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        let err = doc
            .apply(rid(101), StatusUpdate::to(RequestStatus::Merged))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        // Entry unchanged on error.
        assert_eq!(doc.entries[0].status, RequestStatus::Queued);
    }

    #[test]
    fn apply_unknown_id() {
        let mut doc = QueueDocument::new();
        let err = doc
            .apply(rid(999), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn apply_targets_non_terminal_entry_when_id_reused() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merging))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merged))
            .unwrap();
        enqueue(&mut doc, 101, 2000);
        let updated = doc
            .apply(rid(101), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap();
        assert_eq!(updated.seq, 2);
        // The old terminal entry is untouched.
        assert_eq!(doc.entries[0].status, RequestStatus::Merged);
    }

    #[test]
    fn terminal_entries_are_immutable() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merging))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merged))
            .unwrap();
        // The only entry is terminal, so apply finds nothing to mutate.
        let err = doc
            .apply(rid(101), StatusUpdate::to(RequestStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn remove_terminal_entry() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::ConflictCheck))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merging))
            .unwrap();
        doc.apply(rid(101), StatusUpdate::to(RequestStatus::Merged))
            .unwrap();
        let removed = doc.remove(rid(101)).unwrap();
        assert_eq!(removed.status, RequestStatus::Merged);
        assert!(doc.entries.is_empty());
    }

    #[test]
    fn remove_rejects_in_flight_entry() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        let err = doc.remove(rid(101)).unwrap_err();
        assert!(matches!(err, StoreError::NotTerminal { .. }));
        assert_eq!(doc.entries.len(), 1);
    }

    #[test]
    fn remove_unknown_id() {
        let mut doc = QueueDocument::new();
        assert!(matches!(
            doc.remove(rid(5)).unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn document_serde_roundtrip() {
        let mut doc = QueueDocument::new();
        enqueue(&mut doc, 101, 1000);
        enqueue(&mut doc, 102, 1001);
        let json = serde_json::to_string_pretty(&doc).unwrap();
        let back: QueueDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn error_display_actionable() {
        let msg = StoreError::NotFound {
            request_id: rid(42),
        }
        .to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("mergeq status"));

        let msg = StoreError::NotTerminal {
            request_id: rid(42),
            status: RequestStatus::Merging,
        }
        .to_string();
        assert!(msg.contains("merging"));
        assert!(msg.contains("mergeq cleanup"));
    }
}
