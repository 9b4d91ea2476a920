//! In-process tracker of background jobs.
//!
//! One poller tick reads `status.json` of every non-terminal job (mtime
//! cached); one filesystem watcher on the results directory turns
//! terminal result files into exactly-once completion events. Both are
//! idempotent and survive session resets; reset never touches the
//! on-disk state of in-flight runs.

use crate::config::DEDUP_TTL;
use crate::config::EVICTION_DELAY;
use crate::config::POLL_INTERVAL;
use crate::config::WATCH_DEBOUNCE;
use crate::config::WATCHER_RESTART_DELAY;
use notify::RecursiveMode;
use notify::Watcher;
use overseer_common::ensure_accessible_dir;
use overseer_protocol::JobResult;
use overseer_protocol::JobStatus;
use overseer_protocol::status::files;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// In-process pub/sub events for the widget layer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SubagentStarted {
        id: String,
        pid: u32,
        label: String,
        cwd: PathBuf,
        async_dir: PathBuf,
    },
    SubagentComplete {
        id: String,
        success: bool,
        result: Box<JobResult>,
    },
}

/// One tracked background job.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub id: String,
    pub async_dir: PathBuf,
    pub label: String,
    pub started_at: Instant,
    pub status: Option<JobStatus>,
    pub terminal: bool,
    status_mtime: Option<SystemTime>,
}

#[derive(Debug)]
struct RegistryState {
    jobs: HashMap<String, JobEntry>,
    /// Completion dedup: id → dispatch instant.
    dispatched: HashMap<String, Instant>,
    /// Terminal jobs scheduled for removal (kept briefly for the UI).
    evictions: Vec<(String, Instant)>,
    results_root: PathBuf,
    base_cwd: PathBuf,
    session_id: Option<String>,
}

/// Tracks running and recently finished background jobs.
#[derive(Debug, Clone)]
pub struct BackgroundRegistry {
    state: Arc<Mutex<RegistryState>>,
    events: broadcast::Sender<EngineEvent>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundRegistry {
    pub fn new(results_root: PathBuf, base_cwd: PathBuf, session_id: Option<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                jobs: HashMap::new(),
                dispatched: HashMap::new(),
                evictions: Vec::new(),
                results_root,
                base_cwd,
                session_id,
            })),
            events,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a freshly launched job and announce it.
    pub fn register(&self, id: &str, async_dir: &Path, label: &str, pid: u32, cwd: &Path) {
        {
            let mut state = self.lock();
            state.jobs.insert(
                id.to_string(),
                JobEntry {
                    id: id.to_string(),
                    async_dir: async_dir.to_path_buf(),
                    label: label.to_string(),
                    started_at: Instant::now(),
                    status: None,
                    terminal: false,
                    status_mtime: None,
                },
            );
        }
        let _ = self.events.send(EngineEvent::SubagentStarted {
            id: id.to_string(),
            pid,
            label: label.to_string(),
            cwd: cwd.to_path_buf(),
            async_dir: async_dir.to_path_buf(),
        });
    }

    /// Snapshot of tracked jobs for the widget.
    pub fn jobs(&self) -> Vec<JobEntry> {
        let state = self.lock();
        let mut jobs: Vec<JobEntry> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Spawn the poller and the results watcher.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(Self::poll_loop(self.clone())));
        tasks.push(tokio::spawn(Self::watch_loop(self.clone())));
    }

    /// Session start / switch / branch: drop in-memory job state, cancel
    /// eviction timers, reset dedup, rebind cwd and session id. On-disk
    /// state of in-flight runs is left alone.
    pub fn reset_session(&self, base_cwd: PathBuf, session_id: Option<String>) {
        let mut state = self.lock();
        state.jobs.clear();
        state.evictions.clear();
        state.dispatched.clear();
        state.base_cwd = base_cwd;
        state.session_id = session_id;
        info!("background registry reset for new session");
    }

    /// Stop the poller and watcher. Idempotent.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn poll_loop(registry: Self) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            registry.poll_once();
        }
    }

    /// One poller pass: refresh non-terminal jobs whose status file
    /// changed, then apply due evictions.
    fn poll_once(&self) {
        let candidates: Vec<(String, PathBuf, Option<SystemTime>)> = {
            let state = self.lock();
            state
                .jobs
                .values()
                .filter(|j| !j.terminal)
                .map(|j| {
                    (
                        j.id.clone(),
                        j.async_dir.join(files::STATUS),
                        j.status_mtime,
                    )
                })
                .collect()
        };

        for (id, path, cached_mtime) in candidates {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let mtime = meta.modified().ok();
            if mtime.is_some() && mtime == cached_mtime {
                continue;
            }
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(status) = serde_json::from_str::<JobStatus>(&text) else {
                debug!(id = %id, "unparseable status.json, will retry");
                continue;
            };

            let mut state = self.lock();
            if let Some(entry) = state.jobs.get_mut(&id) {
                entry.status_mtime = mtime;
                let terminal = status.state.is_terminal();
                entry.status = Some(status);
                if terminal && !entry.terminal {
                    entry.terminal = true;
                    let deadline = Instant::now() + EVICTION_DELAY;
                    state.evictions.push((id.clone(), deadline));
                }
            }
        }

        let now = Instant::now();
        let mut state = self.lock();
        let due: Vec<String> = state
            .evictions
            .iter()
            .filter(|(_, deadline)| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        state.evictions.retain(|(_, deadline)| *deadline > now);
        for id in due {
            state.jobs.remove(&id);
            debug!(id = %id, "evicted completed job");
        }
        state
            .dispatched
            .retain(|_, dispatched| now.duration_since(*dispatched) < DEDUP_TTL);
    }

    async fn watch_loop(registry: Self) {
        loop {
            let root = registry.lock().results_root.clone();
            if let Err(e) = ensure_accessible_dir(&root) {
                warn!(error = %e, "cannot create results directory, retrying");
                tokio::time::sleep(WATCHER_RESTART_DELAY).await;
                continue;
            }

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let mut watcher = match notify::recommended_watcher(
                move |event: Result<notify::Event, notify::Error>| {
                    let _ = tx.send(event);
                },
            ) {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "failed to create results watcher");
                    tokio::time::sleep(WATCHER_RESTART_DELAY).await;
                    continue;
                }
            };
            if let Err(e) = watcher.watch(&root, RecursiveMode::NonRecursive) {
                warn!(error = %e, "failed to watch results directory");
                tokio::time::sleep(WATCHER_RESTART_DELAY).await;
                continue;
            }

            // Catch results that landed before the watch was in place.
            registry.process_results(&root);

            let restart = loop {
                match rx.recv().await {
                    Some(Ok(_event)) => {
                        // Coalesce the rename bursts a result write makes.
                        tokio::time::sleep(WATCH_DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}
                        registry.process_results(&root);
                        // A reset may have moved the results root.
                        if registry.lock().results_root != root {
                            break false;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "results watcher errored, restarting");
                        break true;
                    }
                    None => break true,
                }
            };
            drop(watcher);
            if restart {
                tokio::time::sleep(WATCHER_RESTART_DELAY).await;
            }
        }
    }

    /// One synchronous scan of the results directory, dispatching any
    /// terminal results found. The watcher calls this on every debounced
    /// burst; callers can use it to pick up results that landed while no
    /// watcher was running.
    pub fn scan_results(&self) {
        let root = self.lock().results_root.clone();
        self.process_results(&root);
    }

    /// Scan the results directory, dispatching any new terminal results.
    fn process_results(&self, root: &Path) {
        let Ok(entries) = fs::read_dir(root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            self.dispatch_result_file(&path);
        }
    }

    fn dispatch_result_file(&self, path: &Path) {
        let parsed: Option<JobResult> = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok());
        let Some(result) = parsed else {
            // Half-written or foreign file; leave it for the next pass.
            return;
        };

        let accept = {
            let state = self.lock();
            let session_match = match &result.session_id {
                Some(sid) => state.session_id.as_deref() == Some(sid.as_str()),
                None => Path::new(&result.cwd) == state.base_cwd,
            };
            let fresh = !state.dispatched.contains_key(&result.id);
            session_match && fresh
        };

        if accept {
            let id = result.id.clone();
            let success = result.success;
            {
                let mut state = self.lock();
                state.dispatched.insert(id.clone(), Instant::now());
                if let Some(entry) = state.jobs.get_mut(&id)
                    && !entry.terminal
                {
                    entry.terminal = true;
                    let deadline = Instant::now() + EVICTION_DELAY;
                    state.evictions.push((id.clone(), deadline));
                }
            }
            let _ = self.events.send(EngineEvent::SubagentComplete {
                id,
                success,
                result: Box::new(result),
            });
        }

        // Delete after dispatch; duplicates and foreign-session files
        // are also consumed so they cannot re-fire forever.
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove result file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use overseer_protocol::JobState;
    use overseer_protocol::RunMode;
    use pretty_assertions::assert_eq;

    fn job_result(id: &str, session_id: Option<&str>, cwd: &Path) -> JobResult {
        JobResult {
            id: id.to_string(),
            agent: "scout".to_string(),
            success: true,
            summary: "done".to_string(),
            results: vec![],
            exit_code: 0,
            timestamp: Utc::now(),
            duration_ms: 10,
            truncated: false,
            artifacts_dir: None,
            cwd: cwd.display().to_string(),
            async_dir: "/tmp/async/x".to_string(),
            session_id: session_id.map(str::to_string),
            session_file: None,
            share_url: None,
            share_error: None,
        }
    }

    fn registry(results_root: &Path, cwd: &Path) -> BackgroundRegistry {
        BackgroundRegistry::new(
            results_root.to_path_buf(),
            cwd.to_path_buf(),
            Some("sess-1".to_string()),
        )
    }

    #[tokio::test]
    async fn completion_event_fires_once_and_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), Path::new("/work"));
        let mut rx = reg.subscribe();

        let path = dir.path().join("job-1.json");
        overseer_common::write_json_atomic(&path, &job_result("job-1", Some("sess-1"), Path::new("/work")))
            .unwrap();
        reg.process_results(dir.path());
        assert!(!path.exists());

        match rx.try_recv().unwrap() {
            EngineEvent::SubagentComplete { id, success, .. } => {
                assert_eq!(id, "job-1");
                assert!(success);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // A second copy of the same result within the TTL is suppressed.
        overseer_common::write_json_atomic(&path, &job_result("job-1", Some("sess-1"), Path::new("/work")))
            .unwrap();
        reg.process_results(dir.path());
        assert!(rx.try_recv().is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn foreign_session_results_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), Path::new("/work"));
        let mut rx = reg.subscribe();

        let path = dir.path().join("other.json");
        overseer_common::write_json_atomic(
            &path,
            &job_result("other", Some("another-session"), Path::new("/work")),
        )
        .unwrap();
        reg.process_results(dir.path());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cwd_match_applies_when_session_id_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = BackgroundRegistry::new(dir.path().to_path_buf(), PathBuf::from("/work"), None);
        let mut rx = reg.subscribe();

        let ok = dir.path().join("a.json");
        overseer_common::write_json_atomic(&ok, &job_result("a", None, Path::new("/work"))).unwrap();
        let other = dir.path().join("b.json");
        overseer_common::write_json_atomic(&other, &job_result("b", None, Path::new("/elsewhere")))
            .unwrap();
        reg.process_results(dir.path());

        match rx.try_recv().unwrap() {
            EngineEvent::SubagentComplete { id, .. } => assert_eq!(id, "a"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn poller_picks_up_terminal_status_and_schedules_eviction() {
        let results = tempfile::tempdir().unwrap();
        let job_dir = tempfile::tempdir().unwrap();
        let reg = registry(results.path(), Path::new("/work"));
        reg.register("j1", job_dir.path(), "scout", 42, Path::new("/work"));

        let status = JobStatus {
            run_id: "j1".to_string(),
            mode: RunMode::Single,
            state: JobState::Complete,
            started_at: Utc::now(),
            last_update: Utc::now(),
            ended_at: Some(Utc::now()),
            pid: 42,
            cwd: "/work".to_string(),
            current_step: 1,
            steps: vec![],
            total_tokens: Some(100),
            output_file: None,
            session_dir: None,
            session_file: None,
            error: None,
        };
        overseer_common::write_json_atomic(&job_dir.path().join(files::STATUS), &status).unwrap();

        reg.poll_once();
        let jobs = reg.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].terminal);
        assert_eq!(
            jobs[0].status.as_ref().map(|s| s.state),
            Some(JobState::Complete)
        );
    }

    #[tokio::test]
    async fn reset_clears_jobs_but_not_disk() {
        let results = tempfile::tempdir().unwrap();
        let job_dir = tempfile::tempdir().unwrap();
        let status_path = job_dir.path().join(files::STATUS);
        fs::write(&status_path, "{}").unwrap();

        let reg = registry(results.path(), Path::new("/work"));
        reg.register("j1", job_dir.path(), "scout", 42, Path::new("/work"));
        assert_eq!(reg.jobs().len(), 1);

        reg.reset_session(PathBuf::from("/new"), Some("sess-2".to_string()));
        assert!(reg.jobs().is_empty());
        // On-disk state of the in-flight run is untouched.
        assert!(status_path.exists());
    }

    #[tokio::test]
    async fn registration_announces_the_job() {
        let results = tempfile::tempdir().unwrap();
        let reg = registry(results.path(), Path::new("/work"));
        let mut rx = reg.subscribe();
        reg.register(
            "j1",
            Path::new("/tmp/async/j1"),
            "scout → planner",
            7,
            Path::new("/work"),
        );
        match rx.try_recv().unwrap() {
            EngineEvent::SubagentStarted { id, pid, label, .. } => {
                assert_eq!(id, "j1");
                assert_eq!(pid, 7);
                assert_eq!(label, "scout → planner");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
