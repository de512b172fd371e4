//! Git CLI implementation of the [`Vcs`] trait.
//!
//! All operations are plumbing-only: nothing here ever touches a working
//! copy or index. Trial merges go through `git merge-tree --write-tree`
//! (writes only to the object store), real merges build commits with
//! `git commit-tree` and advance the trunk ref with a compare-and-swap
//! `git update-ref <ref> <new> <old>` — git holds the ref lock internally,
//! so a concurrent trunk move fails the swap instead of clobbering it.
//!
//! Remote mode (`remote = Some(..)`) reads source/target through the
//! remote-tracking refs and pushes trunk after a successful local update;
//! with no remote configured everything is local (used heavily by tests).

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::model::types::BranchRef;

use super::{MergeStrategy, TrialMerge, Vcs, VcsError};

/// Default deadline for network-bound git commands (fetch/push).
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a child process under a deadline.
const CHILD_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// GitVcs
// ---------------------------------------------------------------------------

/// A git repository the queue operates against.
pub struct GitVcs {
    root: PathBuf,
    remote: Option<String>,
    network_timeout: Duration,
}

impl GitVcs {
    /// A local-only repository (no fetch/push; refs are read directly).
    #[must_use]
    pub const fn local(root: PathBuf) -> Self {
        Self {
            root,
            remote: None,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    /// A repository with a configured remote (fetch before checking, push
    /// after merging).
    #[must_use]
    pub fn with_remote(root: PathBuf, remote: impl Into<String>) -> Self {
        Self {
            root,
            remote: Some(remote.into()),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    /// Override the network deadline.
    #[must_use]
    pub const fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// The ref a branch is read through: the remote-tracking ref in remote
    /// mode, the local head otherwise.
    fn reading_ref(&self, branch: &BranchRef) -> String {
        self.remote.as_ref().map_or_else(
            || format!("refs/heads/{branch}"),
            |remote| format!("refs/remotes/{remote}/{branch}"),
        )
    }

    /// Run a git command to completion with no deadline.
    fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(VcsError::Io)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            Err(classify(args, &stderr, output.status.code()))
        }
    }

    /// Run a git command under a deadline, killing it on expiry.
    ///
    /// Stdout/stderr are drained on separate threads so a chatty child
    /// cannot deadlock against a full pipe while we poll for exit.
    fn git_deadline(&self, args: &[&str], limit: Duration) -> Result<String, VcsError> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(VcsError::Io)?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let out_thread = std::thread::spawn(move || drain(stdout_pipe));
        let err_thread = std::thread::spawn(move || drain(stderr_pipe));

        let deadline = Instant::now() + limit;
        let status = loop {
            match child.try_wait().map_err(VcsError::Io)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = out_thread.join();
                    let _ = err_thread.join();
                    return Err(VcsError::Timeout {
                        command: format!("git {}", args.join(" ")),
                        limit,
                    });
                }
                None => std::thread::sleep(CHILD_POLL),
            }
        };

        let stdout = out_thread.join().unwrap_or_default();
        let stderr = err_thread.join().unwrap_or_default();
        if status.success() {
            Ok(stdout)
        } else {
            Err(classify(args, stderr.trim(), status.code()))
        }
    }

    /// Resolve a ref to a commit id.
    fn rev_parse(&self, reference: &str) -> Result<String, VcsError> {
        match self.git(&["rev-parse", "--verify", "--quiet", &format!("{reference}^{{commit}}")]) {
            Ok(out) => Ok(out.trim().to_owned()),
            Err(VcsError::Git { stderr, .. }) => Err(VcsError::RefMissing {
                reference: reference.to_owned(),
                detail: if stderr.is_empty() {
                    "unknown revision".to_owned()
                } else {
                    stderr
                },
            }),
            Err(e) => Err(e),
        }
    }

    /// Compute the merged tree of two commits, or the conflicting paths.
    fn merge_tree(
        &self,
        ours: &str,
        theirs: &str,
        merge_base: Option<&str>,
    ) -> Result<MergeTreeResult, VcsError> {
        let mut args = vec!["merge-tree", "--write-tree", "--name-only"];
        let base_arg = merge_base.map(|b| format!("--merge-base={b}"));
        if let Some(arg) = &base_arg {
            args.push(arg);
        }
        args.push(ours);
        args.push(theirs);

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.root)
            .output()
            .map_err(VcsError::Io)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();

        // merge-tree exits 0 for a clean merge, 1 for conflicts, <0/other
        // for real errors.
        match output.status.code() {
            Some(0) => {
                let tree = stdout
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_owned();
                Ok(MergeTreeResult::Clean { tree })
            }
            Some(1) => Ok(MergeTreeResult::Conflicted {
                files: parse_conflict_names(&stdout),
            }),
            code => Err(classify(&args, &stderr, code)),
        }
    }

    /// Create a commit object for `tree` with the given parents.
    fn commit_tree(
        &self,
        tree: &str,
        parents: &[&str],
        message: &str,
    ) -> Result<String, VcsError> {
        let mut args = vec!["commit-tree".to_owned(), tree.to_owned()];
        for parent in parents {
            args.push("-p".to_owned());
            args.push((*parent).to_owned());
        }
        args.push("-m".to_owned());
        args.push(message.to_owned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self.git(&arg_refs)?.trim().to_owned())
    }

    /// Advance `refs/heads/<target>` from `old` to `new` with CAS. A
    /// concurrent trunk move surfaces as a transient error so the executor
    /// re-fetches and retries.
    fn advance_trunk(&self, target: &BranchRef, new: &str, old: &str) -> Result<(), VcsError> {
        let ref_name = format!("refs/heads/{target}");
        match self.git(&["update-ref", &ref_name, new, old]) {
            Ok(_) => Ok(()),
            Err(VcsError::Git { stderr, .. })
                if stderr.contains("cannot lock ref")
                    || stderr.contains("is at")
                    || stderr.contains("but expected") =>
            {
                Err(VcsError::Transient {
                    op: format!("git update-ref {ref_name}"),
                    detail: format!("trunk moved concurrently: {stderr}"),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Replay the source commits on top of `onto`, one `merge-tree` +
    /// `commit-tree` per commit. Keeps the zero-working-copy discipline.
    fn replay_linear(
        &self,
        source_head: &str,
        target_head: &str,
    ) -> Result<String, VcsError> {
        let range = format!("{target_head}..{source_head}");
        let list = self.git(&["rev-list", "--reverse", &range])?;
        let mut current = target_head.to_owned();
        for commit in list.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let parent = self.rev_parse(&format!("{commit}^"))?;
            let tree = match self.merge_tree(&current, commit, Some(&parent))? {
                MergeTreeResult::Clean { tree } => tree,
                MergeTreeResult::Conflicted { files } => {
                    return Err(VcsError::MergeConflict { files });
                }
            };
            let message = self.git(&["log", "--format=%B", "-n", "1", commit])?;
            current = self.commit_tree(&tree, &[&current], message.trim_end())?;
        }
        Ok(current)
    }
}

/// Outcome of one `merge-tree --write-tree` invocation.
enum MergeTreeResult {
    Clean { tree: String },
    Conflicted { files: Vec<String> },
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

/// Extract conflicted file names from `merge-tree --write-tree --name-only`
/// output: the first line is the tree id, then one file per line until the
/// blank line that starts the informational-message section.
fn parse_conflict_names(stdout: &str) -> Vec<String> {
    let mut files: Vec<String> = stdout
        .lines()
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_owned())
        .collect();
    files.sort();
    files.dedup();
    files
}

/// Map a failed git command to a [`VcsError`] by stderr fingerprint.
fn classify(args: &[&str], stderr: &str, exit_code: Option<i32>) -> VcsError {
    let command = format!("git {}", args.join(" "));
    let lower = stderr.to_lowercase();

    const AUTH: &[&str] = &[
        "authentication failed",
        "permission denied",
        "could not read username",
        "403",
        "publickey",
    ];
    const TRANSIENT: &[&str] = &[
        "could not resolve host",
        "unable to access",
        "connection refused",
        "connection timed out",
        "timed out",
        "early eof",
        "remote end hung up",
        "rate limit",
        "503",
        "temporarily unavailable",
    ];
    const REF_MISSING: &[&str] = &[
        "couldn't find remote ref",
        "unknown revision",
        "not a valid object name",
        "bad revision",
        "invalid reference",
    ];

    if AUTH.iter().any(|pat| lower.contains(pat)) {
        return VcsError::Auth {
            op: command,
            detail: stderr.to_owned(),
        };
    }
    if TRANSIENT.iter().any(|pat| lower.contains(pat)) {
        return VcsError::Transient {
            op: command,
            detail: stderr.to_owned(),
        };
    }
    if REF_MISSING.iter().any(|pat| lower.contains(pat)) {
        return VcsError::RefMissing {
            reference: command,
            detail: stderr.to_owned(),
        };
    }
    VcsError::Git {
        command,
        stderr: stderr.to_owned(),
        exit_code,
    }
}

// ---------------------------------------------------------------------------
// Vcs impl
// ---------------------------------------------------------------------------

impl Vcs for GitVcs {
    #[instrument(skip(self, refs))]
    fn fetch(&self, refs: &[&BranchRef]) -> Result<(), VcsError> {
        let Some(remote) = &self.remote else {
            // Local mode: refs are already as fresh as they get.
            return Ok(());
        };
        let mut args = vec!["fetch", "--prune", remote.as_str()];
        let names: Vec<&str> = refs.iter().map(|r| r.as_str()).collect();
        args.extend(&names);
        self.git_deadline(&args, self.network_timeout)?;
        debug!(remote, ?names, "fetched refs");
        Ok(())
    }

    fn merge_base(
        &self,
        source: &BranchRef,
        target: &BranchRef,
    ) -> Result<Option<String>, VcsError> {
        let source_ref = self.reading_ref(source);
        let target_ref = self.reading_ref(target);
        // Resolve both first so a deleted branch is RefMissing, not a
        // generic merge-base failure.
        let source_oid = self.rev_parse(&source_ref)?;
        let target_oid = self.rev_parse(&target_ref)?;

        let output = Command::new("git")
            .args(["merge-base", &source_oid, &target_oid])
            .current_dir(&self.root)
            .output()
            .map_err(VcsError::Io)?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            )),
            // Exit 1 with empty stderr: no common ancestor.
            Some(1) if output.stderr.is_empty() => Ok(None),
            code => Err(classify(
                &["merge-base", source.as_str(), target.as_str()],
                String::from_utf8_lossy(&output.stderr).trim(),
                code,
            )),
        }
    }

    #[instrument(skip(self))]
    fn trial_merge(
        &self,
        source: &BranchRef,
        target: &BranchRef,
    ) -> Result<TrialMerge, VcsError> {
        let source_oid = self.rev_parse(&self.reading_ref(source))?;
        let target_oid = self.rev_parse(&self.reading_ref(target))?;
        match self.merge_tree(&target_oid, &source_oid, None)? {
            MergeTreeResult::Clean { .. } => Ok(TrialMerge {
                clean: true,
                conflict_files: Vec::new(),
            }),
            MergeTreeResult::Conflicted { files } => Ok(TrialMerge {
                clean: false,
                conflict_files: files,
            }),
        }
    }

    #[instrument(skip(self, message))]
    fn merge(
        &self,
        source: &BranchRef,
        target: &BranchRef,
        strategy: MergeStrategy,
        message: &str,
    ) -> Result<String, VcsError> {
        let source_oid = self.rev_parse(&self.reading_ref(source))?;
        // The trunk being advanced is always the local head.
        let target_ref = format!("refs/heads/{target}");
        let target_oid = self.rev_parse(&target_ref)?;

        if self.merge_base(source, target)?.is_none() {
            return Err(VcsError::UnrelatedHistories {
                source: source.to_string(),
                target: target.to_string(),
            });
        }

        let new_head = match strategy {
            MergeStrategy::Merge | MergeStrategy::Squash => {
                let tree = match self.merge_tree(&target_oid, &source_oid, None)? {
                    MergeTreeResult::Clean { tree } => tree,
                    MergeTreeResult::Conflicted { files } => {
                        return Err(VcsError::MergeConflict { files });
                    }
                };
                let parents: &[&str] = if strategy == MergeStrategy::Squash {
                    &[&target_oid]
                } else {
                    &[&target_oid, &source_oid]
                };
                self.commit_tree(&tree, parents, message)?
            }
            MergeStrategy::Rebase => self.replay_linear(&source_oid, &target_oid)?,
        };

        // No-op merge (source already contained in trunk): nothing to swap.
        if new_head != target_oid {
            self.advance_trunk(target, &new_head, &target_oid)?;
        }

        if let Some(remote) = &self.remote {
            self.git_deadline(
                &["push", remote, target.as_str()],
                self.network_timeout,
            )?;
        }
        debug!(%source, %target, %strategy, new_head, "merge committed");
        Ok(new_head)
    }

    fn delete_branch(&self, branch: &BranchRef) -> Result<(), VcsError> {
        if let Some(remote) = &self.remote {
            self.git_deadline(
                &["push", remote, "--delete", branch.as_str()],
                self.network_timeout,
            )?;
        }
        // Idempotent locally: deleting an absent ref succeeds.
        let ref_name = format!("refs/heads/{branch}");
        match self.git(&["update-ref", "-d", &ref_name]) {
            Ok(_) | Err(VcsError::RefMissing { .. }) => Ok(()),
            Err(VcsError::Git { stderr, .. })
                if stderr.contains("unable to deref") || stderr.contains("not exist") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
