//! Detached worker process body.
//!
//! Runs in its own process, independent of the session that launched it.
//! Reads the worker input file, executes the flattened steps, maintains
//! `status.json` and `events.jsonl` as it goes, and finishes by writing
//! the Markdown summary, the terminal status, and (strictly last) the
//! terminal result file.

use crate::config::MAX_CONCURRENCY;
use crate::error::EngineResult;
use crate::output::truncate_display;
use crate::parallel::BlockStyle;
use crate::parallel::ScheduledTask;
use crate::parallel::SchedulerEnv;
use crate::parallel::aggregate_output;
use crate::parallel::run_scheduled;
use crate::result::StepResult;
use crate::runner::resolve_runner_bin;
use crate::single::ExecEnv;
use crate::single::run_resolved;
use chrono::Utc;
use overseer_common::append_jsonl_line;
use overseer_common::ensure_accessible_dir;
use overseer_common::write_json_atomic;
use overseer_protocol::JobResult;
use overseer_protocol::JobState;
use overseer_protocol::JobStatus;
use overseer_protocol::JobStepResult;
use overseer_protocol::ResolvedStep;
use overseer_protocol::RunMode;
use overseer_protocol::StepRow;
use overseer_protocol::StepState;
use overseer_protocol::TimelineEvent;
use overseer_protocol::TimelineKind;
use overseer_protocol::WorkerInput;
use overseer_protocol::WorkerStep;
use overseer_protocol::status::files;
use overseer_protocol::status::step_tokens;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

/// Durable state kept by the worker while it runs.
struct WorkerState {
    status: JobStatus,
    status_path: PathBuf,
    events_path: PathBuf,
}

impl WorkerState {
    fn write_status(&mut self) {
        self.status.touch(Utc::now());
        if let Err(e) = write_json_atomic(&self.status_path, &self.status) {
            error!(error = %e, "failed to write status.json");
        }
    }

    fn append_event(&self, event: TimelineEvent) {
        if let Err(e) = append_jsonl_line(&self.events_path, &event) {
            error!(error = %e, "failed to append timeline event");
        }
    }

    fn step_started(&mut self, flat: usize) {
        let agent = {
            let row = &mut self.status.steps[flat];
            row.status = StepState::Running;
            row.started_at = Some(Utc::now());
            row.agent.clone()
        };
        self.status.recompute_current_step();
        self.write_status();
        self.append_event(TimelineEvent::new(TimelineKind::StepStarted).step(flat, &agent));
    }

    fn step_finished(&mut self, flat: usize, result: &StepResult) {
        let (agent, ok) = {
            let row = &mut self.status.steps[flat];
            let ended = Utc::now();
            row.ended_at = Some(ended);
            row.duration_ms = row
                .started_at
                .map(|s| (ended - s).num_milliseconds().max(0) as u64);
            row.exit_code = Some(result.exit_code);
            row.tokens = step_tokens(&result.usage);
            if !result.skills.is_empty() {
                row.skills = Some(result.skills.clone());
            }
            row.status = if result.succeeded() {
                StepState::Complete
            } else {
                StepState::Failed
            };
            (row.agent.clone(), result.succeeded())
        };
        self.status.recompute_current_step();
        self.write_status();
        let kind = if ok {
            TimelineKind::StepCompleted
        } else {
            TimelineKind::StepFailed
        };
        self.append_event(
            TimelineEvent::new(kind)
                .step(flat, &agent)
                .exit_code(result.exit_code),
        );
    }
}

fn initial_status(input: &WorkerInput) -> JobStatus {
    let mut steps = Vec::with_capacity(input.flat_step_count());
    for step in &input.steps {
        match step {
            WorkerStep::Sequential(s) => steps.push(StepRow::pending(&s.agent)),
            WorkerStep::Parallel { parallel, .. } => {
                steps.extend(parallel.iter().map(|s| StepRow::pending(&s.agent)));
            }
        }
    }
    let mode = if input.steps.len() == 1 && matches!(input.steps[0], WorkerStep::Sequential(_)) {
        RunMode::Single
    } else {
        RunMode::Chain
    };
    let now = Utc::now();
    JobStatus {
        run_id: input.id.clone(),
        mode,
        state: JobState::Running,
        started_at: now,
        last_update: now,
        ended_at: None,
        pid: std::process::id(),
        cwd: input.cwd.display().to_string(),
        current_step: 0,
        steps,
        total_tokens: None,
        output_file: None,
        session_dir: input.session_dir.as_ref().map(|p| p.display().to_string()),
        session_file: None,
        error: None,
    }
}

fn substitute_previous(step: &ResolvedStep, placeholder: &str, previous: &str) -> ResolvedStep {
    let mut step = step.clone();
    if step.task.contains(placeholder) {
        step.task = step.task.replace(placeholder, previous);
    }
    step
}

fn job_label(input: &WorkerInput) -> String {
    let names: Vec<String> = input
        .steps
        .iter()
        .map(|s| match s {
            WorkerStep::Sequential(step) => step.agent.clone(),
            WorkerStep::Parallel { parallel, .. } => {
                let inner: Vec<&str> = parallel.iter().map(|p| p.agent.as_str()).collect();
                format!("[{}]", inner.join("+"))
            }
        })
        .collect();
    names.join(" → ")
}

fn markdown_log(input: &WorkerInput, results: &[StepResult], success: bool) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Subagent run {}", input.id);
    let _ = writeln!(md);
    let _ = writeln!(md, "- chain: {}", job_label(input));
    let _ = writeln!(md, "- cwd: {}", input.cwd.display());
    let _ = writeln!(md, "- outcome: {}", if success { "complete" } else { "failed" });
    let _ = writeln!(md);
    for (i, result) in results.iter().enumerate() {
        let _ = writeln!(md, "## Step {} — {}", i + 1, result.agent);
        let _ = writeln!(md);
        let _ = writeln!(
            md,
            "exit {} · {} tools · {} tokens · {} ms",
            result.exit_code,
            result.progress_summary.tool_count,
            result.progress_summary.tokens,
            result.progress_summary.duration_ms
        );
        if let Some(err) = &result.error {
            let _ = writeln!(md, "\nerror: {err}");
        }
        let _ = writeln!(md, "\n```\n{}\n```", result.output.trim_end());
        let _ = writeln!(md);
    }
    md
}

/// Execute a worker input file to completion. The terminal result file
/// is written strictly after the terminal `status.json`.
pub async fn run_worker(input_path: &Path) -> EngineResult<()> {
    let text = fs::read_to_string(input_path)?;
    let input: WorkerInput = serde_json::from_str(&text)?;
    run_worker_input(input).await
}

pub async fn run_worker_input(input: WorkerInput) -> EngineResult<()> {
    let started = Instant::now();
    ensure_accessible_dir(&input.async_dir)?;

    let mut state = WorkerState {
        status: initial_status(&input),
        status_path: input.async_dir.join(files::STATUS),
        events_path: input.async_dir.join(files::EVENTS),
    };
    state.write_status();
    state.append_event(TimelineEvent::new(TimelineKind::RunStarted));
    info!(id = %input.id, steps = state.status.steps.len(), "background run started");

    let runner_bin = match resolve_runner_bin(None) {
        Ok(path) => path,
        Err(e) => {
            let message = e.to_string();
            finish(&mut state, &input, &[], started, Some(message)).await;
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let scheduler = SchedulerEnv {
        runner_bin: runner_bin.clone(),
        cwd: input.cwd.clone(),
        session_dir: input.session_dir.clone(),
        limits: input.max_output,
        cancel: cancel.clone(),
    };
    let artifacts = input.artifacts_dir.as_ref().map(|dir| {
        crate::output::ArtifactWriter::new(dir.clone(), input.id.clone(), input.artifact_config)
    });

    let mut results: Vec<StepResult> = Vec::new();
    let mut previous = String::new();
    let mut flat = 0usize;
    let mut run_error: Option<String> = None;

    for step in &input.steps {
        match step {
            WorkerStep::Sequential(step) => {
                let resolved = substitute_previous(step, &input.placeholder, &previous);
                state.step_started(flat);
                let log_path = input.async_dir.join(files::step_output(flat));
                let env = ExecEnv {
                    runner_bin: &runner_bin,
                    cwd: &input.cwd,
                    session_dir: input.session_dir.as_deref(),
                    limits: input.max_output,
                    artifacts: artifacts.as_ref(),
                    progress: None,
                    cancel: &cancel,
                    stream_log: Some(&log_path),
                };
                let result = run_resolved(&env, &resolved, Some(flat)).await;
                state.step_finished(flat, &result);
                previous = result.output.trim().to_string();
                let failed = !result.succeeded();
                if failed {
                    run_error = result.error.clone();
                }
                results.push(result);
                flat += 1;
                if failed {
                    break;
                }
            }
            WorkerStep::Parallel {
                parallel,
                concurrency,
                fail_fast,
            } => {
                // All rows go running when the group starts; per-task
                // transitions land as each task finishes.
                for (i, _) in parallel.iter().enumerate() {
                    state.step_started(flat + i);
                }
                let scheduled: Vec<ScheduledTask> = parallel
                    .iter()
                    .enumerate()
                    .map(|(i, p)| ScheduledTask {
                        step: substitute_previous(p, &input.placeholder, &previous),
                        artifact_index: Some(flat + i),
                        artifacts: artifacts.clone(),
                        warnings: Vec::new(),
                        stream_log: Some(input.async_dir.join(files::step_output(flat + i))),
                    })
                    .collect();

                let group_results = run_scheduled(
                    &scheduler,
                    scheduled,
                    concurrency.unwrap_or(MAX_CONCURRENCY),
                    *fail_fast,
                    None,
                )
                .await;

                for (i, result) in group_results.iter().enumerate() {
                    state.step_finished(flat + i, result);
                }
                previous = aggregate_output(&group_results, BlockStyle::InChain);
                let group_failed = group_results
                    .iter()
                    .any(|r| !r.succeeded() && !r.was_skipped());
                if group_failed {
                    run_error = group_results
                        .iter()
                        .find(|r| !r.succeeded() && !r.was_skipped())
                        .and_then(|r| r.error.clone())
                        .or(Some("parallel group failed".to_string()));
                }
                flat += group_results.len();
                results.extend(group_results);
                if group_failed {
                    break;
                }
            }
        }
    }

    finish(&mut state, &input, &results, started, run_error).await;
    Ok(())
}

/// Terminal sequence: Markdown log, terminal status, then result file.
async fn finish(
    state: &mut WorkerState,
    input: &WorkerInput,
    results: &[StepResult],
    started: Instant,
    run_error: Option<String>,
) {
    let success = run_error.is_none() && results.iter().all(StepResult::succeeded);

    let summary_raw = results
        .last()
        .map(|r| r.output.clone())
        .unwrap_or_default();
    let summary = truncate_display(&summary_raw, input.max_output, None);

    let md = markdown_log(input, results, success);
    let md_path = input.async_dir.join(files::markdown_log(&input.id));
    if let Err(e) = fs::write(&md_path, md) {
        error!(error = %e, "failed to write markdown log");
    }

    state.status.state = if success {
        JobState::Complete
    } else {
        JobState::Failed
    };
    state.status.ended_at = Some(Utc::now());
    state.status.total_tokens = Some(state.status.sum_tokens());
    state.status.error = run_error.clone();
    state.write_status();
    state.append_event(
        TimelineEvent::new(if success {
            TimelineKind::RunCompleted
        } else {
            TimelineKind::RunFailed
        }),
    );

    let result = JobResult {
        id: input.id.clone(),
        agent: job_label(input),
        success,
        summary: summary.text,
        results: results
            .iter()
            .map(|r| JobStepResult {
                agent: r.agent.clone(),
                output: r.output.clone(),
                success: r.succeeded(),
                skipped: r.was_skipped().then_some(true),
                artifact_paths: r.artifact_paths.as_ref().map(|paths| {
                    paths.iter().map(|p| p.display().to_string()).collect()
                }),
                truncated: r.truncation.as_ref().map(|t| t.was_truncated),
            })
            .collect(),
        exit_code: results
            .iter()
            .map(|r| r.exit_code)
            .find(|c| *c != 0)
            .unwrap_or(i32::from(!success)),
        timestamp: Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
        truncated: summary.info.is_some(),
        artifacts_dir: input
            .artifacts_dir
            .as_ref()
            .map(|p| p.display().to_string()),
        cwd: input.cwd.display().to_string(),
        async_dir: input.async_dir.display().to_string(),
        session_id: input.session_id.clone(),
        session_file: None,
        share_url: None,
        share_error: None,
    };

    if let Some(parent) = input.result_path.parent()
        && let Err(e) = ensure_accessible_dir(parent)
    {
        error!(error = %e, "failed to create results directory");
    }
    if let Err(e) = write_json_atomic(&input.result_path, &result) {
        error!(error = %e, "failed to write terminal result file");
    }
    info!(id = %input.id, success, "background run finished");
}
