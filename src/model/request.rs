//! The persisted merge-request record.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::status::RequestStatus;
use super::types::{BranchRef, RequestId, SessionId};

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Classification of the last error recorded on a request.
///
/// Surfaced by `status` so a caller can see why an entry is
/// `failed`/`timeout` without reading internal logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// A network-level failure (fetch/merge timeouts, transient API errors,
    /// rate limits). Retried with backoff.
    NetworkTransient,
    /// Authentication or permission failure. Never retried automatically.
    AuthorizationFailure,
    /// The trial merge reported conflicting files.
    ConflictDetected,
    /// The entry exceeded the active-age threshold and was reaped.
    Timeout,
    /// A non-recoverable VCS failure outside the classes above (missing
    /// ref, unrelated histories, unexpected git error).
    VcsFailure,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkTransient => write!(f, "network-transient"),
            Self::AuthorizationFailure => write!(f, "authorization-failure"),
            Self::ConflictDetected => write!(f, "conflict-detected"),
            Self::Timeout => write!(f, "timeout"),
            Self::VcsFailure => write!(f, "vcs-failure"),
        }
    }
}

/// The last error recorded on a request: class plus human-readable detail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    /// Error classification.
    pub class: ErrorClass,
    /// Human-readable message (e.g. git stderr, conflicting file summary).
    pub message: String,
}

impl RecordedError {
    /// Create a new recorded error.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for RecordedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

// ---------------------------------------------------------------------------
// MergeRequest
// ---------------------------------------------------------------------------

/// One row in the queue: a pending or completed merge intent.
///
/// `seq` is the authoritative FIFO ordering key, assigned under the queue
/// lock at enqueue time. `enqueued_at` comes from the producer's clock and
/// is kept for display only — producers may be clock-skewed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Monotonic sequence number; defines processing order.
    pub seq: u64,
    /// External identifier of the change (e.g. pull-request number). Unique
    /// among non-terminal entries.
    pub request_id: RequestId,
    /// The feature branch to merge.
    pub source_ref: BranchRef,
    /// The trunk branch to merge into.
    pub target_ref: BranchRef,
    /// The producing session, for audit.
    pub origin_id: SessionId,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Number of re-admissions to the queue (plus executor attempts consumed
    /// by the last failed merge). Bounded by the configured maximum.
    pub retry_count: u32,
    /// Unix timestamp (seconds) when the request was enqueued. Never reset
    /// across retries, so original arrival order stays visible.
    pub enqueued_at: u64,
    /// Unix timestamp (seconds) when the request last entered an active
    /// state; cleared on re-queue. Drives staleness eviction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Last error recorded on this request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RecordedError>,
    /// Conflicting file paths from the most recent conflict check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_files: Vec<String>,
}

impl MergeRequest {
    /// Create a freshly queued request.
    #[must_use]
    pub const fn new(
        seq: u64,
        request_id: RequestId,
        source_ref: BranchRef,
        target_ref: BranchRef,
        origin_id: SessionId,
        now: u64,
    ) -> Self {
        Self {
            seq,
            request_id,
            source_ref,
            target_ref,
            origin_id,
            status: RequestStatus::Queued,
            retry_count: 0,
            enqueued_at: now,
            started_at: None,
            last_error: None,
            conflict_files: Vec::new(),
        }
    }

    /// Seconds since the request was enqueued (zero if the clock went
    /// backwards).
    #[must_use]
    pub const fn waited_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.enqueued_at)
    }

    /// Seconds the request has been in an active state, if it is in one.
    #[must_use]
    pub fn active_secs(&self, now: u64) -> Option<u64> {
        match self.started_at {
            Some(t) if !self.status.is_terminal() => Some(now.saturating_sub(t)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn sample(seq: u64, id: u64, now: u64) -> MergeRequest {
        MergeRequest::new(
            seq,
            RequestId::new(id).unwrap(),
            BranchRef::new("feature/x").unwrap(),
            BranchRef::new("main").unwrap(),
            SessionId::new("term-1").unwrap(),
            now,
        )
    }

    #[test]
    fn new_request_is_queued() {
        let req = sample(1, 101, 1000);
        assert_eq!(req.status, RequestStatus::Queued);
        assert_eq!(req.retry_count, 0);
        assert_eq!(req.enqueued_at, 1000);
        assert!(req.started_at.is_none());
        assert!(req.last_error.is_none());
        assert!(req.conflict_files.is_empty());
    }

    #[test]
    fn waited_secs() {
        let req = sample(1, 101, 1000);
        assert_eq!(req.waited_secs(1060), 60);
        // Clock skew: never underflows.
        assert_eq!(req.waited_secs(500), 0);
    }

    #[test]
    fn active_secs_requires_started_at() {
        let mut req = sample(1, 101, 1000);
        assert_eq!(req.active_secs(2000), None);
        req.status = RequestStatus::Merging;
        req.started_at = Some(1500);
        assert_eq!(req.active_secs(2000), Some(500));
    }

    #[test]
    fn active_secs_none_for_terminal() {
        let mut req = sample(1, 101, 1000);
        req.status = RequestStatus::Merged;
        req.started_at = Some(1500);
        assert_eq!(req.active_secs(2000), None);
    }

    #[test]
    fn serde_roundtrip_minimal() {
        let req = sample(3, 101, 1000);
        let json = serde_json::to_string_pretty(&req).unwrap();
        // Optional fields are omitted when empty.
        assert!(!json.contains("started_at"));
        assert!(!json.contains("last_error"));
        assert!(!json.contains("conflict_files"));
        let back: MergeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn serde_roundtrip_full() {
        let mut req = sample(3, 102, 1000);
        req.status = RequestStatus::ConflictDetected;
        req.started_at = Some(1005);
        req.retry_count = 1;
        req.last_error = Some(RecordedError::new(
            ErrorClass::ConflictDetected,
            "1 conflicting file",
        ));
        req.conflict_files = vec!["x.txt".to_owned()];
        let json = serde_json::to_string_pretty(&req).unwrap();
        assert!(json.contains("conflict_files"));
        let back: MergeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn error_class_display() {
        assert_eq!(ErrorClass::NetworkTransient.to_string(), "network-transient");
        assert_eq!(
            ErrorClass::AuthorizationFailure.to_string(),
            "authorization-failure"
        );
        assert_eq!(ErrorClass::ConflictDetected.to_string(), "conflict-detected");
        assert_eq!(ErrorClass::Timeout.to_string(), "timeout");
    }

    #[test]
    fn recorded_error_display() {
        let err = RecordedError::new(ErrorClass::NetworkTransient, "fetch timed out");
        assert_eq!(err.to_string(), "network-transient: fetch timed out");
    }
}
