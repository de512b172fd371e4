//! Queue configuration.
//!
//! Loaded from `.mergeq/config.toml`; a missing file means all defaults.
//! Unknown keys are rejected so a typo fails loudly instead of silently
//! falling back to a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vcs::MergeStrategy;

#[derive(Debug)]
pub enum ConfigError {
    Parse { path: String, detail: String },
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse { path, detail } => {
                write!(
                    f,
                    "invalid config at {path}: {detail}\nTo fix: correct the file or delete it to use defaults"
                )
            }
            Self::Io(e) => write!(f, "failed to read config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The integration branch merges land on.
    pub trunk: String,
    /// Remote to fetch from / push to. `None` keeps everything local.
    pub remote: Option<String>,
    /// How merges integrate the source history.
    pub strategy: MergeStrategy,
    /// Maximum retries a request gets before it is marked failed.
    pub max_retries: u32,
    /// First backoff delay, in seconds.
    pub backoff_base_secs: u64,
    /// Factor each successive backoff grows by.
    pub backoff_multiplier: u32,
    /// How long an enqueue/process invocation waits for the queue lock.
    pub lock_timeout_secs: u64,
    /// Age after which a dead holder's lock is reclaimed.
    pub lock_staleness_secs: u64,
    /// Age after which an in-flight request is reaped to `timeout`.
    pub stale_after_secs: u64,
    /// Deadline for network-bound VCS commands.
    pub network_timeout_secs: u64,
    /// Timestamped queue backups kept before pruning.
    pub backups_retained: usize,
    /// Delete the source branch after its merge lands.
    pub delete_merged_branches: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trunk: "main".to_owned(),
            remote: None,
            strategy: MergeStrategy::Merge,
            max_retries: 3,
            backoff_base_secs: 5,
            backoff_multiplier: 2,
            lock_timeout_secs: 30,
            lock_staleness_secs: 15 * 60,
            stale_after_secs: 15 * 60,
            network_timeout_secs: 60,
            backups_retained: 5,
            delete_merged_branches: false,
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Write the current values (used by `init` to seed an editable file).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(ConfigError::Io)
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub const fn lock_staleness(&self) -> Duration {
        Duration::from_secs(self.lock_staleness_secs)
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    #[must_use]
    pub const fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}
