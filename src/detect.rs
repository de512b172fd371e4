//! Read-only conflict detection.
//!
//! Answers "would this merge conflict?" without creating commits, moving
//! refs, or touching any working copy. The processor runs this while the
//! queue lock is released, so detection latency never blocks other
//! queue operations.

use tracing::{debug, instrument};

use crate::model::types::BranchRef;
use crate::vcs::{Vcs, VcsError};

/// What a detection pass concluded about a pending merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The merge would apply cleanly.
    Clean,
    /// The merge would conflict in these files (sorted, deduplicated).
    Conflicted { files: Vec<String> },
    /// The branches share no common ancestor. Merging is impossible
    /// without history surgery, so this is terminal rather than retryable.
    NoMergeBase,
}

/// Run a detection pass: refresh refs, confirm a common ancestor exists,
/// then trial-merge in memory.
///
/// Errors from the underlying VCS pass through unclassified; the caller
/// decides retry-vs-fail from [`VcsError::is_recoverable`].
#[instrument(skip(vcs))]
pub fn check(
    vcs: &dyn Vcs,
    source: &BranchRef,
    target: &BranchRef,
) -> Result<Detection, VcsError> {
    vcs.fetch(&[source, target])?;

    if vcs.merge_base(source, target)?.is_none() {
        debug!(%source, %target, "no common ancestor");
        return Ok(Detection::NoMergeBase);
    }

    let trial = vcs.trial_merge(source, target)?;
    if trial.clean {
        debug!(%source, %target, "trial merge clean");
        Ok(Detection::Clean)
    } else {
        debug!(%source, %target, files = trial.conflict_files.len(), "conflicts detected");
        Ok(Detection::Conflicted {
            files: trial.conflict_files,
        })
    }
}
