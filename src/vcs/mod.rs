//! Version-control collaborator boundary.
//!
//! The queue never implements diff/merge itself — it delegates to an
//! external VCS through the [`Vcs`] trait. The production implementation is
//! [`GitVcs`] (git CLI); tests substitute fakes. The trait is deliberately
//! narrow: exactly the five primitives the conflict detector and merge
//! executor consume.

pub mod git;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::request::ErrorClass;
use crate::model::types::BranchRef;

pub use git::GitVcs;

// ---------------------------------------------------------------------------
// MergeStrategy
// ---------------------------------------------------------------------------

/// How the executor combines a source branch into trunk. Caller-supplied
/// policy, not an executor decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Collapse the source branch to a single commit on trunk.
    Squash,
    /// Preserve full history with a two-parent merge commit.
    #[default]
    Merge,
    /// Linearize: replay the source commits on top of trunk.
    Rebase,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Squash => write!(f, "squash"),
            Self::Merge => write!(f, "merge"),
            Self::Rebase => write!(f, "rebase"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "squash" => Ok(Self::Squash),
            "merge" => Ok(Self::Merge),
            "rebase" => Ok(Self::Rebase),
            other => Err(format!(
                "unknown merge strategy '{other}' (expected squash, merge, or rebase)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Vcs trait
// ---------------------------------------------------------------------------

/// The outcome of a trial (in-object-store) merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrialMerge {
    /// `true` if the three-way merge produced no conflicts.
    pub clean: bool,
    /// Conflicting file paths (empty when clean).
    pub conflict_files: Vec<String>,
}

/// The five VCS primitives the queue consumes.
///
/// `fetch` and `trial_merge` must be free of working-copy side effects:
/// they may write to the object store, never to a checkout or index.
pub trait Vcs {
    /// Refresh the given refs from the origin. Network-fragile: failures
    /// classify as transient, not as conflicts.
    ///
    /// # Errors
    /// Returns a [`VcsError`] on fetch failure.
    fn fetch(&self, refs: &[&BranchRef]) -> Result<(), VcsError>;

    /// The merge base of two refs, or `None` if the histories are
    /// unrelated.
    ///
    /// # Errors
    /// Returns a [`VcsError`] if either ref cannot be resolved.
    fn merge_base(&self, source: &BranchRef, target: &BranchRef)
    -> Result<Option<String>, VcsError>;

    /// Compute a trial three-way merge of `source` into `target` without
    /// touching any working copy, reporting conflicting paths.
    ///
    /// # Errors
    /// Returns a [`VcsError`] if the trial merge cannot be computed.
    fn trial_merge(&self, source: &BranchRef, target: &BranchRef)
    -> Result<TrialMerge, VcsError>;

    /// Merge `source` into `target` with the given strategy and commit
    /// message, returning the new trunk commit id.
    ///
    /// # Errors
    /// Returns a [`VcsError`] on failure; [`VcsError::MergeConflict`] if the
    /// merge conflicts despite the pre-check (racing trunk movement).
    fn merge(
        &self,
        source: &BranchRef,
        target: &BranchRef,
        strategy: MergeStrategy,
        message: &str,
    ) -> Result<String, VcsError>;

    /// Delete a source branch after a confirmed merge. Best-effort from the
    /// caller's perspective.
    ///
    /// # Errors
    /// Returns a [`VcsError`] on failure.
    fn delete_branch(&self, branch: &BranchRef) -> Result<(), VcsError>;
}

// ---------------------------------------------------------------------------
// VcsError
// ---------------------------------------------------------------------------

/// Errors from VCS operations, pre-classified for retry dispatch.
#[derive(Debug)]
pub enum VcsError {
    /// Network-level failure (unreachable remote, rate limit, hung
    /// transport). Retried with backoff.
    Transient {
        /// The operation that failed (e.g. `git fetch`).
        op: String,
        /// Detail (usually git stderr).
        detail: String,
    },
    /// A command exceeded its deadline and was killed. Retryable.
    Timeout {
        /// The command that was killed.
        command: String,
        /// The deadline it exceeded.
        limit: Duration,
    },
    /// Authentication or permission failure. Never retried.
    Auth {
        /// The operation that failed.
        op: String,
        /// Detail (usually git stderr).
        detail: String,
    },
    /// A ref could not be resolved (e.g. source branch deleted). Never
    /// retried.
    RefMissing {
        /// The ref in question.
        reference: String,
        /// Detail (usually git stderr).
        detail: String,
    },
    /// Source and target share no common ancestor. Never retried.
    UnrelatedHistories {
        /// The source ref.
        source: String,
        /// The target ref.
        target: String,
    },
    /// The real merge conflicted (trunk moved since the pre-check).
    MergeConflict {
        /// Conflicting file paths, when known.
        files: Vec<String>,
    },
    /// Any other git failure.
    Git {
        /// The command that failed.
        command: String,
        /// Captured stderr.
        stderr: String,
        /// Exit code, if the process exited.
        exit_code: Option<i32>,
    },
    /// Spawning or talking to the git process failed.
    Io(std::io::Error),
}

impl VcsError {
    /// Whether the executor should retry this error with backoff.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// The error class recorded on the request for `status` display.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => ErrorClass::NetworkTransient,
            Self::Auth { .. } => ErrorClass::AuthorizationFailure,
            Self::MergeConflict { .. } => ErrorClass::ConflictDetected,
            Self::RefMissing { .. }
            | Self::UnrelatedHistories { .. }
            | Self::Git { .. }
            | Self::Io(_) => ErrorClass::VcsFailure,
        }
    }
}

impl fmt::Display for VcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { op, detail } => {
                write!(f, "transient failure in {op}: {detail}")
            }
            Self::Timeout { command, limit } => {
                write!(f, "`{command}` exceeded {}s and was killed", limit.as_secs())
            }
            Self::Auth { op, detail } => {
                write!(
                    f,
                    "authorization failure in {op}: {detail}\n  To fix: check credentials and repository permissions; this is never retried automatically."
                )
            }
            Self::RefMissing { reference, detail } => {
                write!(f, "ref '{reference}' could not be resolved: {detail}")
            }
            Self::UnrelatedHistories { source, target } => {
                write!(
                    f,
                    "'{source}' and '{target}' share no common ancestor; refusing to merge unrelated histories"
                )
            }
            Self::MergeConflict { files } => {
                write!(f, "merge conflicted in {} file(s)", files.len())?;
                for file in files {
                    write!(f, "\n  - {file}")?;
                }
                Ok(())
            }
            Self::Git {
                command,
                stderr,
                exit_code,
            } => {
                write!(f, "`{command}` failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::Io(e) => write!(f, "I/O error running git: {e}"),
        }
    }
}

impl std::error::Error for VcsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VcsError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
