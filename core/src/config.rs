//! Engine configuration and tuning constants.

use overseer_protocol::ArtifactConfig;
use overseer_protocol::OutputLimits;
use std::path::PathBuf;
use std::time::Duration;

/// Hard cap on tasks in a top-level parallel request.
pub const MAX_PARALLEL: usize = 16;
/// Default concurrent child processes in a parallel run.
pub const MAX_CONCURRENCY: usize = 4;
/// Minimum interval between throttled `on_update` emissions.
pub const UPDATE_THROTTLE: Duration = Duration::from_millis(50);
/// Task length above which the task spills to a temp file passed via
/// the runner's `@file` escape (command lines this long break on
/// Windows).
pub const TASK_SPILL_BYTES: usize = 8 * 1024;
/// Grace period between terminate and kill on cancellation.
pub const KILL_GRACE: Duration = Duration::from_millis(1500);
/// Background registry poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Result-watcher event coalescing window.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(50);
/// Delay before restarting a failed results watcher.
pub const WATCHER_RESTART_DELAY: Duration = Duration::from_secs(3);
/// Completion dedup TTL.
pub const DEDUP_TTL: Duration = Duration::from_secs(600);
/// How long a terminal job stays registered for the UI widget.
pub const EVICTION_DELAY: Duration = Duration::from_secs(10);
/// Age past which unnamed chain directories are swept at startup.
pub const CHAIN_DIR_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Age past which session artifact directories are swept at startup.
pub const ARTIFACT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Cap on the opt-in raw JSONL artifact.
pub const JSONL_CAP_BYTES: u64 = 50 * 1024 * 1024;
/// Run-history task prefix length.
pub const HISTORY_TASK_PREFIX: usize = 120;

/// Name of the runner executable looked up on PATH.
pub const RUNNER_BIN: &str = "pi";

/// Engine-wide configuration, bound once per session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit runner executable; `None` resolves `pi` from PATH with a
    /// walk-up fallback.
    pub runner_bin: Option<PathBuf>,
    /// Root for background job directories (`<async_root>/<id>/`).
    pub async_root: PathBuf,
    /// Root watched for terminal result files.
    pub results_root: PathBuf,
    /// Root for non-persistent chain directories.
    pub chain_root: PathBuf,
    /// Session directory; artifacts and run history root here when set.
    pub session_dir: Option<PathBuf>,
    pub session_id: Option<String>,
    pub base_cwd: PathBuf,
    pub max_parallel: usize,
    pub max_concurrency: usize,
    pub output_limits: OutputLimits,
    pub artifact_config: ArtifactConfig,
}

impl EngineConfig {
    /// Configuration rooted at the standard state directory
    /// (`~/.overseer`, temp dir fallback).
    pub fn new(base_cwd: PathBuf) -> Self {
        let state_root = dirs::home_dir()
            .map(|h| h.join(".overseer"))
            .unwrap_or_else(|| std::env::temp_dir().join("overseer"));
        Self::rooted(base_cwd, state_root)
    }

    /// Configuration with every durable root under `state_root`. Tests
    /// point this at a temp dir.
    pub fn rooted(base_cwd: PathBuf, state_root: PathBuf) -> Self {
        Self {
            runner_bin: None,
            async_root: state_root.join("background"),
            results_root: state_root.join("results"),
            chain_root: state_root.join("chains"),
            session_dir: None,
            session_id: None,
            base_cwd,
            max_parallel: MAX_PARALLEL,
            max_concurrency: MAX_CONCURRENCY,
            output_limits: OutputLimits::default(),
            artifact_config: ArtifactConfig::default(),
        }
    }

    /// Where artifacts for `run_id` go: the session directory when
    /// present, else a temp path.
    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        match &self.session_dir {
            Some(session) => session.join("artifacts").join(run_id),
            None => std::env::temp_dir()
                .join("overseer-artifacts")
                .join(run_id),
        }
    }
}
