//! Chain orchestration: template threading, the chain directory, and
//! parallel fan-out/fan-in within a chain.

use crate::agent::AgentDefinition;
use crate::output::ArtifactWriter;
use crate::parallel::BlockStyle;
use crate::parallel::ScheduledTask;
use crate::parallel::SchedulerEnv;
use crate::parallel::SnapshotFn;
use crate::parallel::aggregate_output;
use crate::parallel::run_scheduled;
use crate::request::ChainStep;
use crate::request::SequentialStep;
use crate::result::Details;
use crate::result::LiveAgentProgress;
use crate::result::LiveState;
use crate::result::OnUpdate;
use crate::result::StepResult;
use crate::result::chain_agent_labels;
use crate::single::ExecEnv;
use crate::single::ProgressFn;
use crate::single::run_resolved;
use crate::skills::SkillResolver;
use overseer_common::ensure_accessible_dir;
use overseer_protocol::RunMode;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

/// Name of the shared progress file inside the chain directory.
pub const PROGRESS_FILE: &str = "progress.md";

/// Substitute `{task}`, `{previous}`, and `{chain_dir}` in one pass.
/// Substituted text is never rescanned, so output containing a variable
/// token is not expanded again.
pub fn resolve_templates(template: &str, task: &str, previous: &str, chain_dir: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(i) = rest.find('{') {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if let Some(after) = tail.strip_prefix("{task}") {
            out.push_str(task);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{previous}") {
            out.push_str(previous);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{chain_dir}") {
            out.push_str(chain_dir);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Lazily created per-run chain directory. The orchestrator creates it,
/// steps read and write within it, nothing deletes it mid-run.
#[derive(Debug)]
pub struct ChainDir {
    path: PathBuf,
    created: bool,
}

impl ChainDir {
    pub const fn new(path: PathBuf) -> Self {
        Self {
            path,
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory on first use.
    pub fn ensure(&mut self) -> std::io::Result<&Path> {
        if !self.created {
            ensure_accessible_dir(&self.path)?;
            self.created = true;
            debug!(dir = %self.path.display(), "created chain directory");
        }
        Ok(&self.path)
    }

    /// Guarantee `progress.md` exists before a progress-enabled step
    /// runs. Content is agent-maintained; the engine never parses it.
    pub fn ensure_progress_file(&mut self) -> std::io::Result<PathBuf> {
        self.ensure()?;
        let path = self.path.join(PROGRESS_FILE);
        if !path.exists() {
            fs::write(&path, "# Progress\n")?;
        }
        Ok(path)
    }
}

/// Everything a chain run needs.
pub struct ChainEnv<'a> {
    pub scheduler: SchedulerEnv,
    pub agents: &'a HashMap<String, AgentDefinition>,
    pub skills: &'a dyn SkillResolver,
    /// Base artifact writer for sequential steps.
    pub artifacts: Option<ArtifactWriter>,
    pub run_id: String,
    pub max_concurrency: usize,
    pub on_update: Option<OnUpdate>,
}

/// Builds chain-level updates: completed results first, then the running
/// slots, then pending placeholders, so the renderer sees a static
/// layout.
#[derive(Clone)]
struct ChainUpdates {
    on_update: Option<OnUpdate>,
    labels: Vec<String>,
    total_flat: usize,
}

impl ChainUpdates {
    fn emit(
        &self,
        done: &[StepResult],
        live: Option<&[LiveAgentProgress]>,
        current: usize,
        previous: &str,
    ) {
        let Some(cb) = &self.on_update else {
            return;
        };
        let mut details = Details::new(RunMode::Chain);
        details.results = done.to_vec();
        details.chain_agents = Some(self.labels.clone());
        details.current_step_index = Some(current);
        details.total_steps = Some(self.total_flat);
        details.output = previous.to_string();

        let mut slots: Vec<LiveAgentProgress> = done
            .iter()
            .map(|r| {
                let mut slot = LiveAgentProgress::pending(&r.agent);
                slot.state = if r.succeeded() {
                    LiveState::Done
                } else {
                    LiveState::Failed
                };
                slot.tool_count = r.progress_summary.tool_count;
                slot.tokens = r.progress_summary.tokens;
                slot
            })
            .collect();
        if let Some(live) = live {
            slots.extend_from_slice(live);
        }
        while slots.len() < self.total_flat {
            slots.push(LiveAgentProgress::pending("pending"));
        }
        details.progress = Some(slots);
        cb(&details);
    }
}

/// Execute a chain. Stops at the first sequential failure or the first
/// parallel group containing a non-skip failure; the returned details
/// carry every attempted step's result.
pub async fn run_chain(
    env: &ChainEnv<'_>,
    steps: &[ChainStep],
    initial_task: Option<&str>,
    chain_dir_path: PathBuf,
) -> Details {
    let labels = chain_agent_labels(steps);
    let total_flat: usize = steps.iter().map(ChainStep::flat_len).sum();
    let updates = ChainUpdates {
        on_update: env.on_update.clone(),
        labels: labels.clone(),
        total_flat,
    };
    let mut chain_dir = ChainDir::new(chain_dir_path);
    let mut previous = String::new();
    let mut results: Vec<StepResult> = Vec::new();
    let initial = initial_task.unwrap_or("");

    let mut flat_index = 0usize;
    for (step_index, step) in steps.iter().enumerate() {
        match step {
            ChainStep::Sequential(seq) => {
                let task =
                    resolve_chain_task(env, seq, initial, &previous, &mut chain_dir, None, flat_index);

                let progress: Option<ProgressFn> = env.on_update.as_ref().map(|_| {
                    let updates = updates.clone();
                    let done = results.clone();
                    let previous = previous.clone();
                    Arc::new(move |live: &LiveAgentProgress| {
                        updates.emit(&done, Some(std::slice::from_ref(live)), flat_index, &previous);
                    }) as ProgressFn
                });

                let exec = ExecEnv {
                    runner_bin: &env.scheduler.runner_bin,
                    cwd: &env.scheduler.cwd,
                    session_dir: env.scheduler.session_dir.as_deref(),
                    limits: env.scheduler.limits,
                    artifacts: task.artifacts.as_ref(),
                    progress: progress.as_ref(),
                    cancel: &env.scheduler.cancel,
                    stream_log: None,
                };
                let mut result = run_resolved(&exec, &task.step, task.artifact_index).await;
                result.warnings.splice(0..0, task.warnings);

                previous = result.output.trim().to_string();
                let ok = result.succeeded();
                results.push(result);
                flat_index += 1;
                updates.emit(&results, None, flat_index, &previous);
                if !ok {
                    break;
                }
            }
            ChainStep::Parallel(group) => {
                if chain_dir.ensure().is_err() {
                    warn!("failed to create chain directory for parallel group");
                }
                // Pre-create the progress file so concurrent tasks do not
                // race on its creation.
                if group.tasks.iter().any(|t| wants_progress(env, t))
                    && let Err(e) = chain_dir.ensure_progress_file()
                {
                    warn!(error = %e, "failed to pre-create progress file");
                }

                let mut scheduled = Vec::with_capacity(group.tasks.len());
                for (task_index, inner) in group.tasks.iter().enumerate() {
                    scheduled.push(resolve_chain_task(
                        env,
                        inner,
                        initial,
                        &previous,
                        &mut chain_dir,
                        Some((step_index, task_index)),
                        flat_index + task_index,
                    ));
                }

                let snapshot: Option<SnapshotFn> = env.on_update.as_ref().map(|_| {
                    let updates = updates.clone();
                    let done = results.clone();
                    let previous = previous.clone();
                    Arc::new(move |live: &[LiveAgentProgress]| {
                        updates.emit(&done, Some(live), flat_index, &previous);
                    }) as SnapshotFn
                });

                let concurrency = group.concurrency.unwrap_or(env.max_concurrency);
                let group_results = run_scheduled(
                    &env.scheduler,
                    scheduled,
                    concurrency,
                    group.fail_fast,
                    snapshot,
                )
                .await;

                previous = aggregate_output(&group_results, BlockStyle::InChain);
                let group_failed = group_results
                    .iter()
                    .any(|r| !r.succeeded() && !r.was_skipped());
                flat_index += group_results.len();
                results.extend(group_results);
                updates.emit(&results, None, flat_index, &previous);
                if group_failed {
                    break;
                }
            }
        }
    }

    let mut details = Details::new(RunMode::Chain);
    details.chain_agents = Some(labels);
    details.total_steps = Some(total_flat);
    details.current_step_index = Some(flat_index);
    details.output = previous;
    details.results = results;
    if let Some(writer) = &env.artifacts {
        details.artifacts = Some(crate::result::ArtifactsSummary {
            dir: writer.dir().to_path_buf(),
            files: details
                .results
                .iter()
                .filter_map(|r| r.artifact_paths.clone())
                .flatten()
                .collect(),
        });
    }
    details
}

fn wants_progress(env: &ChainEnv<'_>, step: &SequentialStep) -> bool {
    step.overrides.progress.unwrap_or_else(|| {
        env.agents
            .get(&step.agent)
            .is_some_and(|a| a.default_progress)
    })
}

/// Resolve one chain task: templates substituted, progress instruction
/// added, artifacts namespaced for parallel tasks.
fn resolve_chain_task(
    env: &ChainEnv<'_>,
    step: &SequentialStep,
    initial: &str,
    previous: &str,
    chain_dir: &mut ChainDir,
    parallel_slot: Option<(usize, usize)>,
    artifact_index: usize,
) -> ScheduledTask {
    // Dispatcher validation guarantees the agent exists.
    let agent = env
        .agents
        .get(&step.agent)
        .cloned()
        .unwrap_or_else(|| AgentDefinition::new(&step.agent, "unknown"));

    let template = step.task.as_deref().unwrap_or("{previous}");
    if template.contains("{chain_dir}") && chain_dir.ensure().is_err() {
        warn!(agent = %step.agent, "failed to create chain directory");
    }
    let chain_dir_str = chain_dir.path().display().to_string();
    let mut task = resolve_templates(template, initial, previous, &chain_dir_str);

    if wants_progress(env, step) {
        match chain_dir.ensure_progress_file() {
            Ok(path) => {
                task = format!("[Update progress in: {}]\n{task}", path.display());
            }
            Err(e) => warn!(agent = %step.agent, error = %e, "progress file unavailable"),
        }
    }

    let (resolved, warnings) = crate::single::resolve_step(
        &agent,
        &task,
        &step.overrides,
        env.skills,
        &env.scheduler.cwd,
    );

    let artifacts = match parallel_slot {
        Some((step_index, task_index)) => env.artifacts.as_ref().map(|base| {
            // Parallel tasks get their own namespace inside the chain dir.
            let dir = chain_dir
                .path()
                .join(format!("parallel-{step_index}"))
                .join(format!("{task_index}-{}", step.agent));
            ArtifactWriter::new(dir, env.run_id.clone(), base.config())
        }),
        None => env.artifacts.clone(),
    };

    ScheduledTask {
        step: resolved,
        artifact_index: Some(artifact_index),
        artifacts,
        warnings,
        stream_log: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn templates_substitute_all_three_variables() {
        let out = resolve_templates(
            "do {task} with {previous} under {chain_dir}",
            "T",
            "P",
            "/chains/r1",
        );
        assert_eq!(out, "do T with P under /chains/r1");
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        // Previous output containing a variable token stays literal.
        let out = resolve_templates("{previous}", "T", "see {task} above", "/c");
        assert_eq!(out, "see {task} above");
    }

    #[test]
    fn unknown_braces_pass_through() {
        let out = resolve_templates("keep {unknown} and {task}", "T", "", "/c");
        assert_eq!(out, "keep {unknown} and T");
    }

    #[test]
    fn each_occurrence_is_replaced() {
        let out = resolve_templates("{task} then {task}", "T", "", "/c");
        assert_eq!(out, "T then T");
    }

    #[test]
    fn chain_dir_is_created_lazily() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("run-1");
        let mut dir = ChainDir::new(path.clone());
        assert!(!path.exists());
        dir.ensure().unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn progress_file_is_created_once_and_kept() {
        let root = tempfile::tempdir().unwrap();
        let mut dir = ChainDir::new(root.path().join("run-1"));
        let path = dir.ensure_progress_file().unwrap();
        fs::write(&path, "agent notes").unwrap();
        // A later progress-enabled step must not clobber the content.
        let again = dir.ensure_progress_file().unwrap();
        assert_eq!(again, path);
        assert_eq!(fs::read_to_string(&path).unwrap(), "agent notes");
    }
}
