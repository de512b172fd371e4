//! Request status state machine.
//!
//! ```text
//! QUEUED → CONFLICT_CHECK → MERGING → MERGED
//!               │               │
//!               │               ├→ FAILED
//!               │               └→ QUEUED        (transient error, retry budget left)
//!               ├→ CONFLICT_DETECTED → QUEUED    (retry budget left)
//!               │                    └→ FAILED   (budget exhausted)
//!               └→ QUEUED                        (transient fetch error)
//! ```
//!
//! Any non-terminal status can additionally transition to `TIMEOUT` when the
//! stale reaper evicts an entry whose active age exceeded the threshold.
//! `MERGED`, `FAILED`, and `TIMEOUT` are terminal: once written they never
//! change, and they stop blocking re-enqueue of the same request id.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RequestStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a [`MergeRequest`](super::request::MergeRequest).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for the processor; eligible when oldest in the queue.
    Queued,
    /// The conflict detector is computing a trial merge for this entry.
    ConflictCheck,
    /// The merge executor is merging this entry into trunk.
    Merging,
    /// Merge confirmed on trunk. Terminal.
    Merged,
    /// The trial merge reported conflicting files; recorded in the conflict
    /// log. Re-queued or failed depending on the retry budget.
    ConflictDetected,
    /// Retries exhausted or a non-recoverable error occurred. Terminal.
    Failed,
    /// Evicted by the stale reaper after exceeding the active-age threshold.
    /// Terminal.
    Timeout,
}

impl RequestStatus {
    /// Returns `true` for states from which no further automatic transition
    /// occurs (`Merged`, `Failed`, `Timeout`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Timeout)
    }

    /// Returns `true` while the entry occupies the processor (has a
    /// meaningful `started_at`).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::ConflictCheck | Self::Merging | Self::ConflictDetected)
    }

    /// The set of valid next states from this state.
    ///
    /// `Timeout` is reachable from every non-terminal state via the reaper.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Queued => &[Self::ConflictCheck, Self::Timeout],
            Self::ConflictCheck => &[
                Self::Merging,
                Self::ConflictDetected,
                Self::Queued,
                Self::Failed,
                Self::Timeout,
            ],
            Self::Merging => &[Self::Merged, Self::Failed, Self::Queued, Self::Timeout],
            Self::ConflictDetected => &[Self::Queued, Self::Failed, Self::Timeout],
            Self::Merged | Self::Failed | Self::Timeout => &[],
        }
    }

    /// Check whether transitioning to `next` is valid.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::ConflictCheck => write!(f, "conflict-check"),
            Self::Merging => write!(f, "merging"),
            Self::Merged => write!(f, "merged"),
            Self::ConflictDetected => write!(f, "conflict-detected"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// An attempted status transition that the state machine does not permit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionError {
    /// The current status.
    pub from: RequestStatus,
    /// The attempted target status.
    pub to: RequestStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
