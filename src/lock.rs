//! Queue lock — cross-process mutual exclusion over the queue store.
//!
//! The lock is a file created with `O_CREAT|O_EXCL` (atomic on POSIX and
//! NTFS alike), carrying a JSON token with the owner and acquisition time.
//! Acquisition polls with short sleeps up to a bounded timeout. Before each
//! retry the holder's token is inspected: if its age exceeds the staleness
//! threshold the token is presumed abandoned (crashed holder) and forcibly
//! reclaimed.
//!
//! Release is RAII: [`LockGuard`] removes the token on drop, on every exit
//! path including panics. Release is idempotent — if the token was already
//! reclaimed by another process, dropping the guard is a no-op (it only
//! removes a token it still owns).

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default staleness threshold: a lock older than this is presumed
/// abandoned.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(15 * 60);

/// Default bound on how long `acquire` waits.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default sleep between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// The JSON body of the lock file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Token {
    /// `host:pid` of the holder.
    owner: String,
    /// Unix timestamp (seconds) when the lock was acquired.
    acquired_at: u64,
}

fn self_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
    format!("{host}:{}", std::process::id())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// QueueLock
// ---------------------------------------------------------------------------

/// The mutual-exclusion primitive protecting queue-store mutations.
#[derive(Clone, Debug)]
pub struct QueueLock {
    path: PathBuf,
    staleness: Duration,
    poll_interval: Duration,
}

impl QueueLock {
    /// Create a lock over the given token path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            staleness: DEFAULT_STALENESS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the staleness threshold.
    #[must_use]
    pub const fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Override the polling interval (tests use a short one).
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The token file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, blocking up to `timeout`.
    ///
    /// # Errors
    /// [`LockError::Timeout`] if the lock could not be acquired in time;
    /// [`LockError::Io`] on filesystem failure.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire()? {
                Some(guard) => return Ok(guard),
                None => {
                    self.reclaim_if_stale()?;
                    if Instant::now() >= deadline {
                        let holder = self.read_token().ok().flatten();
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            waited: timeout,
                            holder: holder.map(|t| t.owner),
                        });
                    }
                    std::thread::sleep(self.poll_interval.min(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                }
            }
        }
    }

    /// One atomic acquisition attempt. `Ok(None)` means the lock is held.
    fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| LockError::Io(format!("create {}: {e}", dir.display())))?;
        }
        let token = Token {
            owner: self_owner(),
            acquired_at: unix_now(),
        };
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string(&token)
                    .map_err(|e| LockError::Io(format!("serialize token: {e}")))?;
                file.write_all(json.as_bytes())
                    .map_err(|e| LockError::Io(format!("write token: {e}")))?;
                file.sync_all()
                    .map_err(|e| LockError::Io(format!("fsync token: {e}")))?;
                debug!(path = %self.path.display(), owner = %token.owner, "lock acquired");
                Ok(Some(LockGuard {
                    path: self.path.clone(),
                    owner: token.owner,
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(LockError::Io(format!(
                "create {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Read the current token, if the lock file exists and parses.
    fn read_token(&self) -> Result<Option<Token>, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Remove the token if its holder is presumed dead.
    ///
    /// A token that exists but does not parse counts as stale immediately —
    /// a half-written token means its writer died mid-acquire.
    fn reclaim_if_stale(&self) -> Result<(), LockError> {
        let stale = match self.read_token()? {
            Some(token) => {
                let age = unix_now().saturating_sub(token.acquired_at);
                if Duration::from_secs(age) > self.staleness {
                    warn!(
                        path = %self.path.display(),
                        owner = %token.owner,
                        age_secs = age,
                        "reclaiming stale lock"
                    );
                    true
                } else {
                    false
                }
            }
            // File may have vanished (released) or be unparseable.
            None => self.path.exists(),
        };
        if stale {
            // Racing reclaimers are fine: only one rename/create wins next.
            let _ = fs::remove_file(&self.path);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Scoped lock ownership. Dropping the guard releases the lock on every
/// exit path, including panics.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Release explicitly (equivalent to dropping).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Only remove a token we still own: if the lock went stale and was
        // reclaimed, the file now belongs to someone else.
        let ours = match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str::<Token>(&raw)
                .map(|t| t.owner == self.owner)
                .unwrap_or(false),
            Err(_) => false,
        };
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to release lock");
                }
            }
            debug!(path = %self.path.display(), "lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ---------------------------------------------------------------------------
// LockError
// ---------------------------------------------------------------------------

/// Errors from lock operations.
#[derive(Debug)]
pub enum LockError {
    /// The lock was not acquired within the bound. Infrastructure-level:
    /// the caller should retry the whole operation later.
    Timeout {
        /// The token path.
        path: PathBuf,
        /// How long we waited.
        waited: Duration,
        /// The current holder, if its token was readable.
        holder: Option<String>,
    },
    /// Filesystem failure.
    Io(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout {
                path,
                waited,
                holder,
            } => {
                write!(
                    f,
                    "could not acquire queue lock {} within {}s",
                    path.display(),
                    waited.as_secs()
                )?;
                if let Some(owner) = holder {
                    write!(f, " (held by {owner})")?;
                }
                write!(
                    f,
                    "\n  To fix: retry shortly; a stale lock is reclaimed automatically after the staleness threshold."
                )
            }
            Self::Io(msg) => write!(f, "lock I/O error: {msg}"),
        }
    }
}

impl std::error::Error for LockError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn fast_lock(dir: &Path) -> QueueLock {
        QueueLock::new(dir.join("lock")).with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        let guard = lock.acquire(Duration::from_secs(1)).unwrap();
        assert!(lock.path().exists());
        guard.release();
        assert!(!lock.path().exists());
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        {
            let _guard = lock.acquire(Duration::from_secs(1)).unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn release_on_panic() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        let path = lock.path().to_owned();
        let result = std::panic::catch_unwind(move || {
            let _guard = lock.acquire(Duration::from_secs(1)).unwrap();
            panic!("simulated crash inside critical section");
        });
        assert!(result.is_err());
        assert!(!path.exists(), "lock must be released during unwinding");
    }

    #[test]
    fn second_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        let _held = lock.acquire(Duration::from_secs(1)).unwrap();
        let err = lock.acquire(Duration::from_millis(50)).unwrap_err();
        match err {
            LockError::Timeout { holder, .. } => {
                assert!(holder.is_some(), "holder should be reported");
            }
            other => panic!("expected Timeout, got {other}"),
        }
    }

    #[test]
    fn acquire_after_release_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        let guard = lock.acquire(Duration::from_secs(1)).unwrap();
        guard.release();
        let _again = lock.acquire(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path()).with_staleness(Duration::from_secs(60));
        // Simulate a crashed holder: a token from twenty minutes ago.
        let token = Token {
            owner: "otherhost:1234".to_owned(),
            acquired_at: unix_now() - 20 * 60,
        };
        fs::write(lock.path(), serde_json::to_string(&token).unwrap()).unwrap();

        let guard = lock.acquire(Duration::from_secs(1)).unwrap();
        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn fresh_lock_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path()).with_staleness(Duration::from_secs(60));
        let token = Token {
            owner: "otherhost:1234".to_owned(),
            acquired_at: unix_now(),
        };
        fs::write(lock.path(), serde_json::to_string(&token).unwrap()).unwrap();

        assert!(matches!(
            lock.acquire(Duration::from_millis(50)).unwrap_err(),
            LockError::Timeout { .. }
        ));
        // The fresh token survives.
        assert!(lock.path().exists());
    }

    #[test]
    fn unparseable_token_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        fs::write(lock.path(), "half-writ").unwrap();
        let _guard = lock.acquire(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn guard_does_not_remove_reclaimed_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = fast_lock(dir.path());
        let guard = lock.acquire(Duration::from_secs(1)).unwrap();

        // Another process reclaims our token and takes the lock itself.
        let other = Token {
            owner: "otherhost:9999".to_owned(),
            acquired_at: unix_now(),
        };
        fs::write(lock.path(), serde_json::to_string(&other).unwrap()).unwrap();

        drop(guard);
        // Idempotent release: the other holder's token is untouched.
        let raw = fs::read_to_string(lock.path()).unwrap();
        let token: Token = serde_json::from_str(&raw).unwrap();
        assert_eq!(token.owner, "otherhost:9999");
    }

    #[test]
    fn timeout_error_is_actionable() {
        let err = LockError::Timeout {
            path: PathBuf::from("/repo/.mergeq/lock"),
            waited: Duration::from_secs(30),
            holder: Some("host:42".to_owned()),
        };
        let msg = format!("{err}");
        assert!(msg.contains(".mergeq/lock"));
        assert!(msg.contains("host:42"));
        assert!(msg.contains("retry"));
    }
}
