//! CLI command implementations.
//!
//! Every command operates on the `.mergeq/` state directory next to the
//! repository root: `queue.json` (the store), `lock`, `conflicts.jsonl`,
//! and `config.toml`. Producers and processors on the same machine share
//! these files; the lock arbitrates all mutations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use tracing::warn;

use mergeq::config::Config;
use mergeq::conflict_log::ConflictLog;
use mergeq::lock::QueueLock;
use mergeq::model::types::{BranchRef, RequestId, SessionId};
use mergeq::processor::{
    self, EXIT_CORRUPTION, EXIT_LOCK_TIMEOUT, EXIT_OK, IterationOutcome, ProcessError, Processor,
    unix_now,
};
use mergeq::report::StatusReport;
use mergeq::store::{EnqueueOutcome, FileStore, QueueStore as _};
use mergeq::vcs::GitVcs;

pub const STATE_DIR: &str = ".mergeq";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the queue state directory
    ///
    /// Creates `.mergeq/` with an editable `config.toml`. Safe to run
    /// multiple times; an existing config is never overwritten.
    Init,

    /// Add a merge request to the queue
    Enqueue(EnqueueArgs),

    /// Show all queue entries with position, status, and elapsed wait
    Status(StatusArgs),

    /// Run one iteration of the merge loop (or keep running with --watch)
    ///
    /// Exit codes: 0 = iteration completed, 1 = queue lock busy,
    /// 2 = store corruption was detected (a backup restore was attempted;
    /// rerun to continue).
    Process(ProcessArgs),

    /// Transition stale in-flight entries to timeout
    Cleanup(CleanupArgs),

    /// Remove a finished (merged/failed/timeout) entry from the queue
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// External identifier of the change (e.g. a PR number)
    pub request_id: u64,

    /// Feature branch to merge
    pub source: String,

    /// Integration branch (defaults to the configured trunk)
    #[arg(long)]
    pub target: Option<String>,

    /// Producing session, recorded for audit
    #[arg(long, env = "MERGEQ_SESSION", default_value = "local")]
    pub session: String,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Keep processing until interrupted
    #[arg(long)]
    pub watch: bool,

    /// Seconds to sleep between watch iterations
    #[arg(long, default_value_t = 10)]
    pub interval_secs: u64,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Staleness threshold in seconds (defaults to the configured value)
    #[arg(long)]
    pub age_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// The request to remove
    pub request_id: u64,
}

pub fn run(command: Commands) -> Result<u8> {
    match command {
        Commands::Init => init(),
        Commands::Enqueue(args) => enqueue(&args),
        Commands::Status(args) => status(&args),
        Commands::Process(args) => process(&args),
        Commands::Cleanup(args) => cleanup(&args),
        Commands::Remove(args) => remove(&args),
    }
}

// ---------------------------------------------------------------------------
// Shared environment
// ---------------------------------------------------------------------------

/// Resolved paths plus loaded configuration for one invocation.
struct QueueEnv {
    root: PathBuf,
    state_dir: PathBuf,
    config: Config,
}

impl QueueEnv {
    /// `MERGEQ_DIR` overrides the repository root (useful for operating on
    /// a queue from outside the checkout).
    fn open() -> Result<Self> {
        let root = match std::env::var_os("MERGEQ_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("cannot determine working directory")?,
        };
        let state_dir = root.join(STATE_DIR);
        let config = Config::load(&state_dir.join("config.toml"))?;
        Ok(Self {
            root,
            state_dir,
            config,
        })
    }

    fn require_initialized(&self) -> Result<()> {
        if !self.state_dir.is_dir() {
            bail!(
                "no {STATE_DIR}/ directory at {}.\n  To fix: run:\n    mergeq init",
                self.root.display()
            );
        }
        Ok(())
    }

    fn queue_path(&self) -> PathBuf {
        self.state_dir.join("queue.json")
    }

    fn store(&self) -> FileStore {
        FileStore::new(self.queue_path()).with_backups_retained(self.config.backups_retained)
    }

    fn lock(&self) -> QueueLock {
        QueueLock::new(self.state_dir.join("lock")).with_staleness(self.config.lock_staleness())
    }

    fn conflict_log(&self) -> ConflictLog {
        ConflictLog::new(self.state_dir.join("conflicts.jsonl"))
    }

    fn vcs(&self) -> GitVcs {
        let vcs = match &self.config.remote {
            Some(remote) => GitVcs::with_remote(self.root.clone(), remote.clone()),
            None => GitVcs::local(self.root.clone()),
        };
        vcs.with_network_timeout(self.config.network_timeout())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn init() -> Result<u8> {
    let env = QueueEnv::open()?;
    std::fs::create_dir_all(&env.state_dir)
        .with_context(|| format!("cannot create {}", env.state_dir.display()))?;
    let config_path = env.state_dir.join("config.toml");
    if config_path.exists() {
        println!("already initialized at {}", env.state_dir.display());
    } else {
        Config::default().save(&config_path)?;
        println!("initialized {}", env.state_dir.display());
    }
    Ok(EXIT_OK)
}

fn enqueue(args: &EnqueueArgs) -> Result<u8> {
    let env = QueueEnv::open()?;
    env.require_initialized()?;

    let request_id = RequestId::new(args.request_id)?;
    let source = BranchRef::new(&args.source)?;
    let target = match &args.target {
        Some(t) => BranchRef::new(t)?,
        None => BranchRef::new(&env.config.trunk)?,
    };
    let origin = SessionId::new(&args.session)?;

    let mut store = env.store();
    let lock = env.lock();
    let outcome = {
        let _guard = lock.acquire(env.config.lock_timeout())?;
        store.enqueue(request_id, source, target, origin, unix_now())?
    };
    match outcome {
        EnqueueOutcome::Created { seq } => {
            println!("queued request {request_id} (position key {seq})");
        }
        EnqueueOutcome::AlreadyQueued => {
            println!("request {request_id} is already queued");
        }
    }
    Ok(EXIT_OK)
}

fn status(args: &StatusArgs) -> Result<u8> {
    let env = QueueEnv::open()?;
    env.require_initialized()?;

    // Read-only snapshot; status never contends for the lock.
    let doc = FileStore::snapshot(&env.queue_path())?;
    let report = StatusReport::build(&doc.entries, unix_now());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(EXIT_OK)
}

fn process(args: &ProcessArgs) -> Result<u8> {
    let env = QueueEnv::open()?;
    env.require_initialized()?;

    let mut store = env.store();
    let lock = env.lock();
    let vcs = env.vcs();
    let conflict_log = env.conflict_log();

    if !args.watch {
        return Ok(run_one(
            &mut store,
            &lock,
            &vcs,
            &conflict_log,
            &env.config,
        ));
    }

    let interval = Duration::from_secs(args.interval_secs.max(1));
    loop {
        let code = run_one(&mut store, &lock, &vcs, &conflict_log, &env.config);
        // Corruption needs operator attention; lock contention and normal
        // iterations just roll into the next tick.
        if code == EXIT_CORRUPTION {
            return Ok(code);
        }
        std::thread::sleep(interval);
    }
}

/// One iteration, with the process exit-code contract applied.
fn run_one(
    store: &mut FileStore,
    lock: &QueueLock,
    vcs: &GitVcs,
    conflict_log: &ConflictLog,
    config: &Config,
) -> u8 {
    let mut processor = Processor::new(store, lock, vcs, conflict_log, config);
    match processor.run_iteration() {
        Ok(IterationOutcome::Idle { reaped }) => {
            if reaped > 0 {
                println!("reaped {reaped} stale entries; queue empty");
            } else {
                println!("queue empty");
            }
            EXIT_OK
        }
        Ok(IterationOutcome::Advanced {
            request_id,
            status,
            reaped,
        }) => {
            if reaped > 0 {
                println!("reaped {reaped} stale entries");
            }
            println!("request {request_id}: {status}");
            EXIT_OK
        }
        Err(error @ ProcessError::LockTimeout(_)) => {
            warn!(%error, "lock not acquired");
            eprintln!("{error}");
            EXIT_LOCK_TIMEOUT
        }
        Err(error) => {
            eprintln!("{error}");
            error.exit_code()
        }
    }
}

fn cleanup(args: &CleanupArgs) -> Result<u8> {
    let env = QueueEnv::open()?;
    env.require_initialized()?;

    let threshold = args
        .age_secs
        .map_or_else(|| env.config.stale_after(), Duration::from_secs);
    let mut store = env.store();
    let lock = env.lock();
    let reaped = {
        let _guard = lock.acquire(env.config.lock_timeout())?;
        processor::reap(&mut store, threshold, unix_now())?
    };
    if reaped.is_empty() {
        println!("no stale entries");
    } else {
        for id in &reaped {
            println!("request {id}: timeout");
        }
    }
    Ok(EXIT_OK)
}

fn remove(args: &RemoveArgs) -> Result<u8> {
    let env = QueueEnv::open()?;
    env.require_initialized()?;

    let request_id = RequestId::new(args.request_id)?;
    let mut store = env.store();
    let lock = env.lock();
    let removed = {
        let _guard = lock.acquire(env.config.lock_timeout())?;
        store.remove(request_id)?
    };
    println!("removed request {} ({})", removed.request_id, removed.status);
    Ok(EXIT_OK)
}
