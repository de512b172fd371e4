//! Queue processing: one iteration of the dequeue/check/merge loop, plus
//! the stale-entry reaper.
//!
//! The lock discipline is the core of this module. The lock is held only
//! for queue mutations; conflict detection and merge execution run
//! unlocked because they can take seconds and would otherwise starve
//! every other producer. Each relock re-reads the store, so an entry
//! reaped or removed while we were unlocked surfaces as a store error on
//! the next `apply` rather than a silent overwrite.
//!
//! Sequence for one request:
//!
//! ```text
//! lock   { reap; dequeue; queued -> conflict_check (started_at = now) }
//! unlock { detect }
//! lock   { record detection; conflict_check -> merging | conflict_detected | queued | failed }
//! unlock { merge (bounded retries) }
//! lock   { merging -> merged | queued | failed }
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::conflict_log::{ConflictLog, ConflictLogError, ConflictRecord};
use crate::detect::{self, Detection};
use crate::executor::{MergeExecutor, MergeOutcome};
use crate::lock::{LockError, QueueLock};
use crate::model::request::{ErrorClass, MergeRequest, RecordedError};
use crate::model::status::RequestStatus;
use crate::model::types::RequestId;
use crate::store::{QueueStore, StatusUpdate, StoreError};
use crate::vcs::Vcs;

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// Errors and exit codes
// ---------------------------------------------------------------------------

pub const EXIT_OK: u8 = 0;
pub const EXIT_LOCK_TIMEOUT: u8 = 1;
pub const EXIT_CORRUPTION: u8 = 2;
pub const EXIT_FAILURE: u8 = 3;

#[derive(Debug)]
pub enum ProcessError {
    /// The queue lock was not acquired within its timeout.
    LockTimeout(LockError),
    /// A store operation failed (including corruption detection).
    Store(StoreError),
    /// The conflict audit log could not be written.
    ConflictLog(ConflictLogError),
}

impl ProcessError {
    /// The process-level exit code contract: 1 for lock contention, 2 for
    /// store corruption, 3 for everything else.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::LockTimeout(_) => EXIT_LOCK_TIMEOUT,
            Self::Store(StoreError::Corruption { .. }) => EXIT_CORRUPTION,
            Self::Store(_) | Self::ConflictLog(_) => EXIT_FAILURE,
        }
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockTimeout(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::ConflictLog(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<LockError> for ProcessError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => Self::LockTimeout(e),
            LockError::Io(_) => Self::Store(StoreError::Io(e.to_string())),
        }
    }
}

impl From<StoreError> for ProcessError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ConflictLogError> for ProcessError {
    fn from(e: ConflictLogError) -> Self {
        Self::ConflictLog(e)
    }
}

/// What one `process` iteration accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// No queued entries were eligible.
    Idle { reaped: usize },
    /// One request was driven to the given status (terminal, or `queued`
    /// when re-admitted for retry).
    Advanced {
        request_id: RequestId,
        status: RequestStatus,
        reaped: usize,
    },
}

// ---------------------------------------------------------------------------
// Stale reaper
// ---------------------------------------------------------------------------

/// Transition every non-terminal entry whose active age exceeds
/// `threshold` to `timeout`. Entries still waiting in `queued` (no
/// `started_at`) are never reaped; terminal entries are left for audit.
pub fn reap(
    store: &mut dyn QueueStore,
    threshold: Duration,
    now: u64,
) -> Result<Vec<RequestId>, StoreError> {
    let mut reaped = Vec::new();
    for entry in store.list()? {
        if entry.status.is_terminal() {
            continue;
        }
        let Some(active) = entry.active_secs(now) else {
            continue;
        };
        if active > threshold.as_secs() {
            warn!(
                request_id = %entry.request_id,
                status = %entry.status,
                active_secs = active,
                "reaping stale entry"
            );
            store.apply(
                entry.request_id,
                StatusUpdate::to(RequestStatus::Timeout).error(RecordedError {
                    class: ErrorClass::Timeout,
                    message: format!("stale after {active}s in {}", entry.status),
                }),
            )?;
            reaped.push(entry.request_id);
        }
    }
    Ok(reaped)
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Drives single iterations of the queue loop.
///
/// Stateless between iterations; safe to rebuild per invocation. Multiple
/// concurrent processors are safe because every mutation revalidates the
/// entry's state under the lock.
pub struct Processor<'a, S: QueueStore> {
    store: &'a mut S,
    lock: &'a QueueLock,
    vcs: &'a dyn Vcs,
    conflict_log: &'a ConflictLog,
    config: &'a Config,
}

impl<'a, S: QueueStore> Processor<'a, S> {
    pub fn new(
        store: &'a mut S,
        lock: &'a QueueLock,
        vcs: &'a dyn Vcs,
        conflict_log: &'a ConflictLog,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            lock,
            vcs,
            conflict_log,
            config,
        }
    }

    /// Run one iteration: reap, dequeue the oldest queued entry, and drive
    /// it to its next resting state.
    #[instrument(skip(self))]
    pub fn run_iteration(&mut self) -> Result<IterationOutcome, ProcessError> {
        let now = unix_now();

        // Phase 1 (locked): reap, then claim the oldest queued entry.
        let claimed = {
            let _guard = self.lock.acquire(self.config.lock_timeout())?;
            let reaped = reap(self.store, self.config.stale_after(), now)?.len();
            match self.store.next_eligible()? {
                None => return Ok(IterationOutcome::Idle { reaped }),
                Some(entry) => {
                    self.store.apply(
                        entry.request_id,
                        StatusUpdate::to(RequestStatus::ConflictCheck).started(now),
                    )?;
                    (entry, reaped)
                }
            }
        };
        let (request, reaped) = claimed;
        info!(request_id = %request.request_id, source = %request.source_ref, "processing");

        // Phase 2 (unlocked): read-only conflict detection.
        let detection = detect::check(self.vcs, &request.source_ref, &request.target_ref);

        // Phase 3 (locked): record the detection outcome.
        let proceed = {
            let _guard = self.lock.acquire(self.config.lock_timeout())?;
            match detection {
                Ok(Detection::Clean) => {
                    self.store
                        .apply(request.request_id, StatusUpdate::to(RequestStatus::Merging))?;
                    true
                }
                Ok(Detection::Conflicted { files }) => {
                    self.conflict_log.append(&ConflictRecord {
                        request_id: request.request_id,
                        files: files.clone(),
                        recorded_at: unix_now(),
                    })?;
                    self.store.apply(
                        request.request_id,
                        StatusUpdate::to(RequestStatus::ConflictDetected)
                            .conflicts(files.clone())
                            .error(RecordedError {
                                class: ErrorClass::ConflictDetected,
                                message: format!("{} conflicting file(s)", files.len()),
                            }),
                    )?;
                    // A conflict costs one retry; re-admit or give up.
                    let status = self.retry_or_fail(&request, request.retry_count + 1, None)?;
                    return Ok(IterationOutcome::Advanced {
                        request_id: request.request_id,
                        status,
                        reaped,
                    });
                }
                Ok(Detection::NoMergeBase) => {
                    self.store.apply(
                        request.request_id,
                        StatusUpdate::to(RequestStatus::Failed).error(RecordedError {
                            class: ErrorClass::VcsFailure,
                            message: format!(
                                "{} and {} share no common ancestor",
                                request.source_ref, request.target_ref
                            ),
                        }),
                    )?;
                    false
                }
                Err(error) => {
                    let class = error.class();
                    let recoverable = error.is_recoverable();
                    let recorded = RecordedError {
                        class,
                        message: error.to_string(),
                    };
                    let status = if recoverable {
                        // Detection failure costs one retry.
                        self.retry_or_fail(&request, request.retry_count + 1, Some(recorded))?
                    } else {
                        self.store.apply(
                            request.request_id,
                            StatusUpdate::to(RequestStatus::Failed).error(recorded),
                        )?;
                        RequestStatus::Failed
                    };
                    return Ok(IterationOutcome::Advanced {
                        request_id: request.request_id,
                        status,
                        reaped,
                    });
                }
            }
        };
        if !proceed {
            return Ok(IterationOutcome::Advanced {
                request_id: request.request_id,
                status: RequestStatus::Failed,
                reaped,
            });
        }

        // Phase 4 (unlocked): the merge itself, with the request's
        // remaining retry budget.
        let budget = self.config.max_retries.saturating_sub(request.retry_count);
        let report = MergeExecutor::new(self.vcs)
            .with_backoff(self.config.backoff_base(), self.config.backoff_multiplier)
            .execute(
                &request.source_ref,
                &request.target_ref,
                self.config.strategy,
                &merge_message(&request),
                budget,
            );

        // Phase 5 (locked): persist the terminal or retry state.
        let status = {
            let _guard = self.lock.acquire(self.config.lock_timeout())?;
            match report.outcome {
                MergeOutcome::Merged { commit } => {
                    // Failed retries on the way to success still count.
                    self.store.apply(
                        request.request_id,
                        StatusUpdate::to(RequestStatus::Merged)
                            .retries(request.retry_count + report.attempts - 1),
                    )?;
                    info!(request_id = %request.request_id, commit, "merged");
                    RequestStatus::Merged
                }
                MergeOutcome::Conflicted { files } => {
                    // Trunk moved between the check and the merge.
                    self.conflict_log.append(&ConflictRecord {
                        request_id: request.request_id,
                        files: files.clone(),
                        recorded_at: unix_now(),
                    })?;
                    let recorded = RecordedError {
                        class: ErrorClass::ConflictDetected,
                        message: format!("{} conflicting file(s) at merge time", files.len()),
                    };
                    let retries = request.retry_count + 1;
                    let status = if retries < self.config.max_retries {
                        RequestStatus::Queued
                    } else {
                        RequestStatus::Failed
                    };
                    let mut update = StatusUpdate::to(status)
                        .retries(retries)
                        .conflicts(files)
                        .error(recorded);
                    if status == RequestStatus::Queued {
                        update = update.cleared_start();
                    }
                    self.store.apply(request.request_id, update)?;
                    status
                }
                MergeOutcome::Failed { error } => {
                    let recorded = RecordedError {
                        class: error.class(),
                        message: error.to_string(),
                    };
                    let retries = request.retry_count + report.attempts;
                    if error.is_recoverable() && retries < self.config.max_retries {
                        self.retry_or_fail(&request, retries, Some(recorded))?
                    } else {
                        self.store.apply(
                            request.request_id,
                            StatusUpdate::to(RequestStatus::Failed)
                                .retries(retries)
                                .error(recorded),
                        )?;
                        RequestStatus::Failed
                    }
                }
            }
        };

        // Branch deletion is best-effort and runs unlocked; a failure here
        // never affects the recorded merge.
        if status == RequestStatus::Merged && self.config.delete_merged_branches {
            if let Err(error) = self.vcs.delete_branch(&request.source_ref) {
                warn!(branch = %request.source_ref, %error, "could not delete merged branch");
            }
        }

        Ok(IterationOutcome::Advanced {
            request_id: request.request_id,
            status,
            reaped,
        })
    }

    /// Re-admit the request with `retries` recorded, or mark it failed if
    /// the budget is spent. Caller must hold the lock.
    fn retry_or_fail(
        &mut self,
        request: &MergeRequest,
        retries: u32,
        error: Option<RecordedError>,
    ) -> Result<RequestStatus, StoreError> {
        let status = if retries < self.config.max_retries {
            RequestStatus::Queued
        } else {
            RequestStatus::Failed
        };
        let mut update = StatusUpdate::to(status).retries(retries);
        if status == RequestStatus::Queued {
            // Back of eligibility by state only; seq (arrival order) is kept.
            update = update.cleared_start();
        }
        if let Some(error) = error {
            update = update.error(error);
        }
        self.store.apply(request.request_id, update)?;
        info!(
            request_id = %request.request_id,
            retries,
            %status,
            "request re-admitted or exhausted"
        );
        Ok(status)
    }
}

fn merge_message(request: &MergeRequest) -> String {
    format!(
        "Merge {} into {} (request {})",
        request.source_ref, request.target_ref, request.request_id
    )
}
