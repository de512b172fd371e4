//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use mergeq::model::types::{BranchRef, RequestId, SessionId};
use mergeq::vcs::{MergeStrategy, TrialMerge, Vcs, VcsError};

/// A throwaway git repository with an initial commit on `main`.
pub struct TestRepo {
    pub dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Self { dir };
        repo.git(&["init", "-b", "main"]);
        repo.git(&["config", "user.name", "test"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.write("base.txt", "base\n");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "base"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join(".mergeq")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(path, content).expect("write file");
    }

    /// Run git in the repo, asserting success.
    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .expect("git must be runnable in tests");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    /// Create `branch` off main and commit `content` to `file` on it.
    pub fn branch_with_commit(&self, branch: &str, file: &str, content: &str) {
        self.git(&["branch", branch, "main"]);
        self.git(&["checkout", "-q", branch]);
        self.write(file, content);
        self.git(&["add", "."]);
        self.git(&["commit", "-m", &format!("commit on {branch}")]);
        self.git(&["checkout", "-q", "main"]);
    }

    /// Commit directly to main (moves trunk under queued branches).
    pub fn commit_on_main(&self, file: &str, content: &str) {
        self.git(&["checkout", "-q", "main"]);
        self.write(file, content);
        self.git(&["add", "."]);
        self.git(&["commit", "-m", &format!("main: {file}")]);
    }
}

pub fn rid(n: u64) -> RequestId {
    RequestId::new(n).expect("valid request id")
}

pub fn branch(name: &str) -> BranchRef {
    BranchRef::new(name).expect("valid branch ref")
}

pub fn session(name: &str) -> SessionId {
    SessionId::new(name).expect("valid session id")
}

// ---------------------------------------------------------------------------
// Scriptable VCS double
// ---------------------------------------------------------------------------

/// In-memory VCS whose merges pop scripted results; trial merges report
/// the configured conflict set.
pub struct FakeVcs {
    pub conflicts: std::sync::Mutex<Vec<String>>,
    pub merge_script: std::sync::Mutex<Vec<Result<String, VcsError>>>,
}

impl FakeVcs {
    pub fn clean() -> Self {
        Self {
            conflicts: std::sync::Mutex::new(Vec::new()),
            merge_script: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn conflicting(files: &[&str]) -> Self {
        Self {
            conflicts: std::sync::Mutex::new(files.iter().map(|&f| f.to_owned()).collect()),
            merge_script: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_merges(mut script: Vec<Result<String, VcsError>>) -> Self {
        script.reverse();
        Self {
            conflicts: std::sync::Mutex::new(Vec::new()),
            merge_script: std::sync::Mutex::new(script),
        }
    }
}

impl Vcs for FakeVcs {
    fn fetch(&self, _refs: &[&BranchRef]) -> Result<(), VcsError> {
        Ok(())
    }

    fn merge_base(
        &self,
        _source: &BranchRef,
        _target: &BranchRef,
    ) -> Result<Option<String>, VcsError> {
        Ok(Some("base".into()))
    }

    fn trial_merge(
        &self,
        _source: &BranchRef,
        _target: &BranchRef,
    ) -> Result<TrialMerge, VcsError> {
        let conflicts = self.conflicts.lock().expect("lock conflicts").clone();
        Ok(TrialMerge {
            clean: conflicts.is_empty(),
            conflict_files: conflicts,
        })
    }

    fn merge(
        &self,
        _source: &BranchRef,
        _target: &BranchRef,
        _strategy: MergeStrategy,
        _message: &str,
    ) -> Result<String, VcsError> {
        self.merge_script
            .lock()
            .expect("lock script")
            .pop()
            .unwrap_or(Ok("fake-head".into()))
    }

    fn delete_branch(&self, _branch: &BranchRef) -> Result<(), VcsError> {
        Ok(())
    }
}
