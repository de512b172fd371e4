//! Merge execution with bounded retries.
//!
//! The executor is stateless between invocations: the processor hands it a
//! source/target pair plus a retry budget, it drives the VCS merge, and it
//! reports how many attempts it burned so the processor can account them
//! against the request's `retry_count`.
//!
//! Only recoverable errors (network, rate limit, ref-lock races) are
//! retried, with exponential backoff plus a small random jitter to keep
//! concurrent executors from thundering in lock-step. Auth failures,
//! missing refs, and merge conflicts stop the attempt loop immediately.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::model::types::BranchRef;
use crate::vcs::{MergeStrategy, Vcs, VcsError};

/// Default first backoff delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default backoff growth factor (5s, 10s, 20s, ...).
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// How a single executor invocation ended.
#[derive(Debug)]
pub enum MergeOutcome {
    /// The merge landed; `commit` is the new trunk head.
    Merged { commit: String },
    /// The merge hit content conflicts (detected at merge time, e.g. trunk
    /// moved after the conflict check).
    Conflicted { files: Vec<String> },
    /// The merge could not land within the attempt budget.
    Failed { error: VcsError },
}

/// Executor result: the outcome plus the number of attempts consumed.
#[derive(Debug)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub attempts: u32,
}

type Sleeper = Box<dyn Fn(Duration)>;

/// Drives a merge to completion or exhaustion against a [`Vcs`].
pub struct MergeExecutor<'a> {
    vcs: &'a dyn Vcs,
    backoff_base: Duration,
    backoff_multiplier: u32,
    sleeper: Sleeper,
}

impl<'a> MergeExecutor<'a> {
    #[must_use]
    pub fn new(vcs: &'a dyn Vcs) -> Self {
        Self {
            vcs,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            sleeper: Box::new(std::thread::sleep),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, multiplier: u32) -> Self {
        self.backoff_base = base;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Replace the real sleep, used by tests to run retries instantly.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Attempt the merge up to `attempt_budget` times.
    ///
    /// Each failed attempt (recoverable or not) counts toward
    /// `MergeReport.attempts`; a success also counts its own attempt, so
    /// a first-try merge reports `attempts == 1` and the caller typically
    /// discounts the successful one.
    pub fn execute(
        &self,
        source: &BranchRef,
        target: &BranchRef,
        strategy: MergeStrategy,
        message: &str,
        attempt_budget: u32,
    ) -> MergeReport {
        let budget = attempt_budget.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.vcs.merge(source, target, strategy, message) {
                Ok(commit) => {
                    debug!(%source, %target, attempts, "merge succeeded");
                    return MergeReport {
                        outcome: MergeOutcome::Merged { commit },
                        attempts,
                    };
                }
                Err(VcsError::MergeConflict { files }) => {
                    return MergeReport {
                        outcome: MergeOutcome::Conflicted { files },
                        attempts,
                    };
                }
                Err(error) if error.is_recoverable() && attempts < budget => {
                    let delay = self.backoff_for(attempts);
                    warn!(
                        %source, %target, attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "recoverable merge failure, backing off"
                    );
                    (self.sleeper)(delay);
                }
                Err(error) => {
                    warn!(%source, %target, attempts, %error, "merge failed");
                    return MergeReport {
                        outcome: MergeOutcome::Failed { error },
                        attempts,
                    };
                }
            }
        }
    }

    /// Delay before retry number `attempt + 1`: base * multiplier^(attempt-1)
    /// plus up to 20% jitter.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.backoff_base.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(u64::from(factor));
        let jitter_ms = if delay_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=delay_ms / 5)
        };
        Duration::from_millis(delay_ms.saturating_add(jitter_ms))
    }
}
