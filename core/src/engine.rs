//! The engine: request validation, mode dispatch, and session lifecycle.
//!
//! One `Engine` owns all global mutable state (background registry,
//! session binding, sweeps). Validation and depth-guard failures are
//! returned before any side effect; runner failures surface inside the
//! returned `Details`.

use crate::agent::AgentDefinition;
use crate::background;
use crate::background::registry::BackgroundRegistry;
use crate::chain::ChainEnv;
use crate::chain::run_chain;
use crate::config::CHAIN_DIR_TTL;
use crate::config::EngineConfig;
use crate::depth;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::manage;
use crate::manage::ManageAction;
use crate::manage::ManageOutcome;
use crate::output::ArtifactWriter;
use crate::output::sweep_stale_artifacts;
use crate::output::sweep_stale_dirs;
use crate::parallel::BlockStyle;
use crate::parallel::ScheduledTask;
use crate::parallel::SchedulerEnv;
use crate::parallel::SnapshotFn;
use crate::parallel::aggregate_output;
use crate::parallel::run_scheduled;
use crate::request::ChainStep;
use crate::request::ExecutionRequest;
use crate::request::RequestMode;
use crate::request::SequentialStep;
use crate::result::Details;
use crate::result::LiveAgentProgress;
use crate::result::OnUpdate;
use crate::runner::resolve_runner_bin;
use crate::single::ExecEnv;
use crate::single::ProgressFn;
use crate::single::resolve_step;
use crate::single::run_resolved;
use crate::skills::SkillResolver;
use crate::store::AgentStore;
use overseer_protocol::ResolvedStep;
use overseer_protocol::RunMode;
use overseer_protocol::WorkerInput;
use overseer_protocol::WorkerStep;
use overseer_protocol::status::files;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// The orchestration engine. One per session.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn AgentStore>,
    skills: Arc<dyn SkillResolver>,
    registry: BackgroundRegistry,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn AgentStore>,
        skills: Arc<dyn SkillResolver>,
    ) -> Self {
        let registry = BackgroundRegistry::new(
            config.results_root.clone(),
            config.base_cwd.clone(),
            config.session_id.clone(),
        );
        let swept = sweep_stale_dirs(&config.chain_root, CHAIN_DIR_TTL);
        if swept > 0 {
            info!(swept, "swept stale chain directories");
        }
        if let Some(session) = &config.session_dir {
            sweep_stale_artifacts(session);
        }
        Self {
            config,
            store,
            skills,
            registry,
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn registry(&self) -> &BackgroundRegistry {
        &self.registry
    }

    /// Start the background poller/watcher. Call once a runtime exists.
    pub fn start(&self) {
        self.registry.start();
    }

    /// Session start / switch / branch (§4.9).
    pub fn reset_session(
        &mut self,
        base_cwd: PathBuf,
        session_dir: Option<PathBuf>,
        session_id: Option<String>,
    ) {
        self.config.base_cwd.clone_from(&base_cwd);
        self.config.session_dir = session_dir;
        self.config.session_id.clone_from(&session_id);
        self.registry.reset_session(base_cwd, session_id);
        if let Some(session) = &self.config.session_dir {
            sweep_stale_artifacts(session);
        }
    }

    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    /// Management short-circuit (§4.10).
    pub fn manage(
        &self,
        action: ManageAction,
        known_models: &[String],
    ) -> EngineResult<ManageOutcome> {
        manage::handle(self.store.as_ref(), action, known_models)
    }

    /// Execute a request (§4.1). Validation errors return before any
    /// side effect; the depth guard blocks nested engine calls.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        on_update: Option<OnUpdate>,
        cancel: CancellationToken,
    ) -> EngineResult<Details> {
        depth::check()?;

        let agents = self.load_referenced_agents(&request)?;
        validate_shape(&request)?;

        let cwd = request
            .cwd
            .clone()
            .unwrap_or_else(|| self.config.base_cwd.clone());
        let run_id = Uuid::new_v4().simple().to_string();

        // Background is permitted for single and chain when the TUI is
        // not needed; parallel silently downgrades to foreground.
        let mut notes = Vec::new();
        let background = match (&request.mode, request.background, request.clarify) {
            (RequestMode::Parallel { .. }, true, _) => {
                notes.push("background not supported for parallel; running in foreground".to_string());
                false
            }
            (_, true, true) => {
                notes.push("clarification requires the foreground; running synchronously".to_string());
                false
            }
            (_, requested, _) => requested,
        };

        if background {
            let mut details = self.launch_background(&request, &agents, &cwd, &run_id)?;
            details.notes.splice(0..0, notes);
            return Ok(details);
        }

        let mut details = self
            .run_foreground(&request, &agents, &cwd, &run_id, on_update, cancel)
            .await?;
        details.notes.splice(0..0, notes);
        Ok(details)
    }

    fn load_referenced_agents(
        &self,
        request: &ExecutionRequest,
    ) -> EngineResult<HashMap<String, AgentDefinition>> {
        let all = self.store.list_agents(request.agent_scope)?;
        let by_name: HashMap<String, AgentDefinition> =
            all.into_iter().map(|a| (a.name.clone(), a)).collect();

        let referenced: Vec<&str> = match &request.mode {
            RequestMode::Single { agent, .. } => vec![agent.as_str()],
            RequestMode::Parallel { tasks } => tasks.iter().map(|t| t.agent.as_str()).collect(),
            RequestMode::Chain { steps, .. } => {
                steps.iter().flat_map(|s| s.agents().into_iter()).collect()
            }
        };
        for name in referenced {
            if !by_name.contains_key(name) {
                let mut available: Vec<String> = by_name.keys().cloned().collect();
                available.sort();
                return Err(EngineError::UnknownAgent {
                    name: name.to_string(),
                    available,
                });
            }
        }
        Ok(by_name)
    }

    async fn run_foreground(
        &self,
        request: &ExecutionRequest,
        agents: &HashMap<String, AgentDefinition>,
        cwd: &Path,
        run_id: &str,
        on_update: Option<OnUpdate>,
        cancel: CancellationToken,
    ) -> EngineResult<Details> {
        let runner_bin = resolve_runner_bin(self.config.runner_bin.as_deref())?;
        let limits = request.max_output.unwrap_or(self.config.output_limits);
        let artifact_config = request.artifacts.unwrap_or(self.config.artifact_config);
        let session_dir = request
            .session_dir
            .clone()
            .or_else(|| self.config.session_dir.clone());
        let artifacts = ArtifactWriter::new(
            self.config.artifacts_dir(run_id),
            run_id.to_string(),
            artifact_config,
        );
        let scheduler = SchedulerEnv {
            runner_bin,
            cwd: cwd.to_path_buf(),
            session_dir,
            limits,
            cancel,
        };

        match &request.mode {
            RequestMode::Single {
                agent,
                task,
                overrides,
            } => {
                let definition = &agents[agent.as_str()];
                let (step, warnings) =
                    resolve_step(definition, task, overrides, self.skills.as_ref(), cwd);

                let progress: Option<ProgressFn> = on_update.as_ref().map(|cb| {
                    let cb = cb.clone();
                    Arc::new(move |live: &LiveAgentProgress| {
                        let mut details = Details::new(RunMode::Single);
                        details.progress = Some(vec![live.clone()]);
                        cb(&details);
                    }) as ProgressFn
                });

                let env = ExecEnv {
                    runner_bin: &scheduler.runner_bin,
                    cwd,
                    session_dir: scheduler.session_dir.as_deref(),
                    limits,
                    artifacts: Some(&artifacts),
                    progress: progress.as_ref(),
                    cancel: &scheduler.cancel,
                    stream_log: None,
                };
                let mut result = run_resolved(&env, &step, None).await;
                result.warnings.splice(0..0, warnings);

                let mut details = Details::new(RunMode::Single);
                details.output.clone_from(&result.output);
                if let Some(paths) = &result.artifact_paths {
                    details.artifacts = Some(crate::result::ArtifactsSummary {
                        dir: artifacts.dir().to_path_buf(),
                        files: paths.clone(),
                    });
                }
                details.results = vec![result];
                if let Some(cb) = &on_update {
                    cb(&details);
                }
                Ok(details)
            }

            RequestMode::Parallel { tasks } => {
                let scheduled: Vec<ScheduledTask> = tasks
                    .iter()
                    .enumerate()
                    .map(|(i, t)| {
                        let definition = &agents[t.agent.as_str()];
                        let (step, warnings) = resolve_step(
                            definition,
                            &t.task,
                            &t.overrides,
                            self.skills.as_ref(),
                            cwd,
                        );
                        ScheduledTask {
                            step,
                            artifact_index: Some(i),
                            artifacts: Some(artifacts.clone()),
                            warnings,
                            stream_log: None,
                        }
                    })
                    .collect();

                let snapshot: Option<SnapshotFn> = on_update.as_ref().map(|cb| {
                    let cb = cb.clone();
                    Arc::new(move |live: &[LiveAgentProgress]| {
                        let mut details = Details::new(RunMode::Parallel);
                        details.progress = Some(live.to_vec());
                        cb(&details);
                    }) as SnapshotFn
                });

                let results = run_scheduled(
                    &scheduler,
                    scheduled,
                    self.config.max_concurrency,
                    false,
                    snapshot,
                )
                .await;

                let mut details = Details::new(RunMode::Parallel);
                details.output = aggregate_output(&results, BlockStyle::TopLevel);
                details.results = results;
                if let Some(cb) = &on_update {
                    cb(&details);
                }
                Ok(details)
            }

            RequestMode::Chain { steps, task } => {
                let chain_dir = request
                    .chain_dir
                    .clone()
                    .unwrap_or_else(|| self.config.chain_root.clone())
                    .join(run_id);
                let env = ChainEnv {
                    scheduler,
                    agents,
                    skills: self.skills.as_ref(),
                    artifacts: Some(artifacts),
                    run_id: run_id.to_string(),
                    max_concurrency: self.config.max_concurrency,
                    on_update,
                };
                Ok(run_chain(&env, steps, task.as_deref(), chain_dir).await)
            }
        }
    }

    /// Resolve everything except `{previous}` and hand the run to a
    /// detached worker process.
    fn launch_background(
        &self,
        request: &ExecutionRequest,
        agents: &HashMap<String, AgentDefinition>,
        cwd: &Path,
        run_id: &str,
    ) -> EngineResult<Details> {
        let limits = request.max_output.unwrap_or(self.config.output_limits);
        let artifact_config = request.artifacts.unwrap_or(self.config.artifact_config);
        let session_dir = request
            .session_dir
            .clone()
            .or_else(|| self.config.session_dir.clone());

        let (mode, steps) = match &request.mode {
            RequestMode::Single {
                agent,
                task,
                overrides,
            } => {
                let definition = &agents[agent.as_str()];
                let (step, _warnings) =
                    resolve_step(definition, task, overrides, self.skills.as_ref(), cwd);
                (RunMode::Single, vec![WorkerStep::Sequential(step)])
            }
            RequestMode::Chain { steps, task } => {
                let chain_dir = request
                    .chain_dir
                    .clone()
                    .unwrap_or_else(|| self.config.chain_root.clone())
                    .join(run_id);
                let resolved =
                    self.resolve_background_chain(steps, task.as_deref(), agents, cwd, &chain_dir)?;
                (RunMode::Chain, resolved)
            }
            RequestMode::Parallel { .. } => {
                // The dispatcher downgraded this path already.
                return Err(EngineError::Validation(
                    "parallel requests cannot run in the background".to_string(),
                ));
            }
        };

        let async_dir = self.config.async_root.join(run_id);
        let input = WorkerInput {
            id: run_id.to_string(),
            steps,
            result_path: self.config.results_root.join(files::result_file(run_id)),
            cwd: cwd.to_path_buf(),
            placeholder: "{previous}".to_string(),
            max_output: limits,
            artifacts_dir: artifact_config
                .enabled
                .then(|| self.config.artifacts_dir(run_id)),
            artifact_config,
            session_dir,
            async_dir: async_dir.clone(),
            session_id: self.config.session_id.clone(),
        };

        let launch = background::spawn(&input)?;
        let label = match &request.mode {
            RequestMode::Single { agent, .. } => agent.clone(),
            RequestMode::Chain { steps, .. } => {
                crate::result::chain_agent_labels(steps).join(" → ")
            }
            RequestMode::Parallel { .. } => unreachable!("rejected above"),
        };
        self.registry
            .register(run_id, &async_dir, &label, launch.pid, cwd);

        let mut details = Details::new(mode);
        details.async_id = Some(run_id.to_string());
        details.async_dir = Some(async_dir);
        details.output = format!("started background run {run_id}");
        Ok(details)
    }

    /// Pre-resolve a chain for the worker: `{task}` and `{chain_dir}`
    /// substituted, progress files pre-created, agent overrides applied.
    /// `{previous}` is left for the worker.
    fn resolve_background_chain(
        &self,
        steps: &[ChainStep],
        initial_task: Option<&str>,
        agents: &HashMap<String, AgentDefinition>,
        cwd: &Path,
        chain_dir: &Path,
    ) -> EngineResult<Vec<WorkerStep>> {
        let mut chain = crate::chain::ChainDir::new(chain_dir.to_path_buf());
        let initial = initial_task.unwrap_or("");
        let mut out = Vec::with_capacity(steps.len());

        let resolve_one = |step: &SequentialStep,
                               chain: &mut crate::chain::ChainDir|
         -> EngineResult<ResolvedStep> {
            let definition = &agents[step.agent.as_str()];
            let template = step.task.as_deref().unwrap_or("{previous}");
            if template.contains("{chain_dir}") {
                chain.ensure()?;
            }
            let dir_str = chain.path().display().to_string();
            // Keep the `{previous}` token literal for the worker.
            let mut task =
                crate::chain::resolve_templates(template, initial, "{previous}", &dir_str);
            let progress = step
                .overrides
                .progress
                .unwrap_or(definition.default_progress);
            if progress {
                let path = chain.ensure_progress_file()?;
                task = format!("[Update progress in: {}]\n{task}", path.display());
            }
            let (resolved, _warnings) =
                resolve_step(definition, &task, &step.overrides, self.skills.as_ref(), cwd);
            Ok(resolved)
        };

        for step in steps {
            match step {
                ChainStep::Sequential(seq) => {
                    out.push(WorkerStep::Sequential(resolve_one(seq, &mut chain)?));
                }
                ChainStep::Parallel(group) => {
                    let mut parallel = Vec::with_capacity(group.tasks.len());
                    for inner in &group.tasks {
                        parallel.push(resolve_one(inner, &mut chain)?);
                    }
                    out.push(WorkerStep::Parallel {
                        parallel,
                        concurrency: group.concurrency,
                        fail_fast: group.fail_fast,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Structural validation (§4.1): mode shape and limits. Agent existence
/// is checked separately so the error can list what is available.
fn validate_shape(request: &ExecutionRequest) -> EngineResult<()> {
    match &request.mode {
        RequestMode::Single { agent, task, .. } => {
            if agent.is_empty() {
                return Err(EngineError::Validation("agent name is empty".to_string()));
            }
            if task.trim().is_empty() {
                return Err(EngineError::Validation("task is empty".to_string()));
            }
        }
        RequestMode::Parallel { tasks } => {
            if tasks.is_empty() {
                return Err(EngineError::Validation(
                    "parallel request has no tasks".to_string(),
                ));
            }
            if tasks.len() > crate::config::MAX_PARALLEL {
                return Err(EngineError::TooManyParallel {
                    count: tasks.len(),
                    max: crate::config::MAX_PARALLEL,
                });
            }
        }
        RequestMode::Chain { steps, task } => {
            if steps.is_empty() {
                return Err(EngineError::EmptyChain);
            }
            // The first step has no previous output to reference; it must
            // carry an explicit task (the chain-level task counts via the
            // {task} template).
            let first_ok = match &steps[0] {
                ChainStep::Sequential(s) => s.task.is_some() || task.is_some(),
                ChainStep::Parallel(group) => group
                    .tasks
                    .iter()
                    .all(|t| t.task.is_some() || task.is_some()),
            };
            if !first_ok {
                return Err(EngineError::MissingFirstTask);
            }
            for step in steps {
                if let ChainStep::Parallel(group) = step
                    && group.tasks.is_empty()
                {
                    return Err(EngineError::Validation(
                        "parallel chain step has no tasks".to_string(),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentScope;
    use crate::request::ParallelGroup;
    use crate::request::RunOverrides;
    use crate::request::TaskSpec;
    use crate::skills::FsSkillResolver;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn engine_with(agents: Vec<AgentDefinition>) -> (Engine, tempfile::TempDir) {
        let state = tempfile::tempdir().unwrap();
        let config = EngineConfig::rooted(state.path().join("cwd"), state.path().join("state"));
        let engine = Engine::new(
            config,
            Arc::new(MemoryStore::with_agents(agents)),
            Arc::new(FsSkillResolver::default()),
        );
        (engine, state)
    }

    fn seq(agent: &str, task: Option<&str>) -> SequentialStep {
        SequentialStep {
            agent: agent.to_string(),
            task: task.map(str::to_string),
            overrides: RunOverrides::default(),
        }
    }

    #[tokio::test]
    async fn unknown_agent_error_lists_available_names() {
        let (engine, _dir) = engine_with(vec![
            AgentDefinition::new("scout", "m"),
            AgentDefinition::new("planner", "m"),
        ]);
        let err = engine
            .execute(
                ExecutionRequest::single("ghost", "hi"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            EngineError::UnknownAgent { name, available } => {
                assert_eq!(name, "ghost");
                assert_eq!(available, vec!["planner", "scout"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_is_rejected() {
        let (engine, _dir) = engine_with(vec![]);
        let err = engine
            .execute(
                ExecutionRequest::chain(vec![], None),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyChain));
    }

    #[tokio::test]
    async fn first_chain_step_needs_a_task() {
        let (engine, _dir) = engine_with(vec![AgentDefinition::new("scout", "m")]);
        let err = engine
            .execute(
                ExecutionRequest::chain(vec![ChainStep::Sequential(seq("scout", None))], None),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingFirstTask));

        // A chain-level task satisfies the requirement through {task}.
        let request = ExecutionRequest::chain(
            vec![ChainStep::Sequential(seq("scout", None))],
            Some("scan".to_string()),
        );
        assert!(validate_shape(&request).is_ok());
    }

    #[tokio::test]
    async fn first_parallel_step_needs_tasks_everywhere() {
        let request = ExecutionRequest::chain(
            vec![ChainStep::Parallel(ParallelGroup {
                tasks: vec![seq("a", Some("x")), seq("b", None)],
                concurrency: None,
                fail_fast: false,
            })],
            None,
        );
        assert!(matches!(
            validate_shape(&request),
            Err(EngineError::MissingFirstTask)
        ));
    }

    #[tokio::test]
    async fn over_limit_parallel_is_rejected() {
        let tasks: Vec<TaskSpec> = (0..17)
            .map(|i| TaskSpec {
                agent: "scout".to_string(),
                task: format!("t{i}"),
                overrides: RunOverrides::default(),
            })
            .collect();
        let request = ExecutionRequest::parallel(tasks);
        assert!(matches!(
            validate_shape(&request),
            Err(EngineError::TooManyParallel { count: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn depth_guard_blocks_before_any_side_effect() {
        let _env = crate::depth::ENV_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let (engine, _dir) = engine_with(vec![AgentDefinition::new("scout", "m")]);
        unsafe {
            std::env::set_var(depth::DEPTH_ENV, "2");
        }
        let err = engine
            .execute(
                ExecutionRequest::single("scout", "hi"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        unsafe {
            std::env::remove_var(depth::DEPTH_ENV);
        }
        assert!(err.to_string().contains("Nested subagent call blocked"));
    }

    #[test]
    fn management_routes_through_the_store() {
        let (engine, _dir) = engine_with(vec![AgentDefinition::new("scout", "m")]);
        let outcome = engine
            .manage(
                ManageAction::List {
                    scope: AgentScope::Both,
                },
                &[],
            )
            .unwrap();
        assert_eq!(outcome.agents.len(), 1);
    }
}
