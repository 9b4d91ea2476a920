//! Bounded-concurrency fan-out with ordered results.
//!
//! The scheduler runs over fully resolved steps so the top-level parallel
//! mode, parallel groups inside chains, and the background worker all
//! share one implementation. Results are always assembled in input order
//! regardless of completion order.

use crate::output::ArtifactWriter;
use crate::result::EXIT_CANCELLED;
use crate::result::LiveAgentProgress;
use crate::result::StepResult;
use crate::single::ExecEnv;
use crate::single::ProgressFn;
use crate::single::run_resolved;
use overseer_protocol::OutputLimits;
use overseer_protocol::ResolvedStep;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One unit of scheduled work.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub step: ResolvedStep,
    pub artifact_index: Option<usize>,
    pub artifacts: Option<ArtifactWriter>,
    /// Resolution warnings (missing skills) carried onto the result.
    pub warnings: Vec<String>,
    /// Raw stream log target (background runs).
    pub stream_log: Option<PathBuf>,
}

/// Shared context for a scheduled group.
#[derive(Debug, Clone)]
pub struct SchedulerEnv {
    pub runner_bin: PathBuf,
    pub cwd: PathBuf,
    pub session_dir: Option<PathBuf>,
    pub limits: OutputLimits,
    pub cancel: CancellationToken,
}

/// Merged snapshot callback: invoked with the full progress vector after
/// every slot update.
pub type SnapshotFn = Arc<dyn Fn(&[LiveAgentProgress]) + Send + Sync>;

/// Run `tasks` with at most `concurrency` children in flight.
///
/// A non-positive bound is clamped to 1 (strictly sequential). With
/// `fail_fast`, the first non-skip failure cancels in-flight peers and
/// pre-empts queued ones; both come back as skipped results.
pub async fn run_scheduled(
    env: &SchedulerEnv,
    tasks: Vec<ScheduledTask>,
    concurrency: usize,
    fail_fast: bool,
    on_snapshot: Option<SnapshotFn>,
) -> Vec<StepResult> {
    let slots: Arc<Mutex<Vec<LiveAgentProgress>>> = Arc::new(Mutex::new(
        tasks
            .iter()
            .map(|t| LiveAgentProgress::pending(&t.step.agent))
            .collect(),
    ));

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let group_cancel = env.cancel.child_token();
    let failed = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        // Acquiring before the spawn keeps admission in input order, so
        // a fail-fast trigger deterministically pre-empts later tasks.
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            handles.push(tokio::spawn(async move {
                StepResult::skipped(&task.step.agent, &task.step.model)
            }));
            continue;
        };
        let group_cancel = group_cancel.clone();
        let failed = Arc::clone(&failed);
        let slots = Arc::clone(&slots);
        let on_snapshot = on_snapshot.clone();
        let env = env.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            if fail_fast && failed.load(Ordering::SeqCst) {
                return StepResult::skipped(&task.step.agent, &task.step.model);
            }
            if group_cancel.is_cancelled() {
                let mut result =
                    StepResult::new(&task.step.agent, &task.step.model, &task.step.task);
                result.exit_code = EXIT_CANCELLED;
                result.error = Some("cancelled".to_string());
                return result;
            }

            let progress: ProgressFn = Arc::new(move |live: &LiveAgentProgress| {
                let snapshot = {
                    let mut vec = slots.lock().unwrap_or_else(|e| e.into_inner());
                    vec[index] = live.clone();
                    vec.clone()
                };
                if let Some(cb) = &on_snapshot {
                    cb(&snapshot);
                }
            });

            let exec = ExecEnv {
                runner_bin: &env.runner_bin,
                cwd: &env.cwd,
                session_dir: env.session_dir.as_deref(),
                limits: env.limits,
                artifacts: task.artifacts.as_ref(),
                progress: Some(&progress),
                cancel: &group_cancel,
                stream_log: task.stream_log.as_deref(),
            };
            let mut result = run_resolved(&exec, &task.step, task.artifact_index).await;
            result.warnings.splice(0..0, task.warnings);

            if fail_fast && !result.succeeded() && !result.was_skipped() {
                failed.store(true, Ordering::SeqCst);
                group_cancel.cancel();
            }
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(index, error = %e, "parallel task panicked");
                let mut failed = StepResult::new("unknown", "unknown", "");
                failed.exit_code = 1;
                failed.error = Some(format!("task join error: {e}"));
                results.push(failed);
            }
        }
    }

    // Peers cancelled by a fail-fast trigger (rather than by the caller)
    // surface as skipped, not cancelled.
    if fail_fast && failed.load(Ordering::SeqCst) && !env.cancel.is_cancelled() {
        for result in &mut results {
            if result.exit_code == EXIT_CANCELLED {
                *result = StepResult::skipped(&result.agent, &result.model);
            }
        }
    }

    results
}

/// Header style for aggregate blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStyle {
    TopLevel,
    InChain,
}

/// Concatenate per-task blocks in input order.
pub fn aggregate_output(results: &[StepResult], style: BlockStyle) -> String {
    let label = match style {
        BlockStyle::TopLevel => "Task",
        BlockStyle::InChain => "Parallel Task",
    };
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("=== {label} {} ({}) ===\n", i + 1, result.agent));
        out.push_str(&block_body(result));
    }
    out
}

fn block_body(result: &StepResult) -> String {
    if result.was_skipped() {
        return "(skipped — fail-fast)".to_string();
    }
    if result.exit_code != 0 {
        let detail = result
            .error
            .as_deref()
            .map(|e| format!("\n{e}"))
            .unwrap_or_default();
        return format!("⚠️ FAILED (exit code {}){detail}", result.exit_code);
    }
    if result.output.trim().is_empty() && result.output_file.is_none() {
        return "⚠️ EMPTY OUTPUT".to_string();
    }
    result.output.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ok_result(agent: &str, output: &str) -> StepResult {
        let mut result = StepResult::new(agent, "m", "t");
        result.output = output.to_string();
        result
    }

    #[test]
    fn aggregate_preserves_input_order() {
        let results = vec![ok_result("a", "first"), ok_result("b", "second")];
        let out = aggregate_output(&results, BlockStyle::TopLevel);
        let a_pos = out.find("=== Task 1 (a) ===").unwrap();
        let b_pos = out.find("=== Task 2 (b) ===").unwrap();
        assert!(a_pos < b_pos);
        assert!(out.contains("first"));
        assert!(out.contains("second"));
    }

    #[test]
    fn failed_block_carries_exit_code() {
        let mut failed = StepResult::new("a", "m", "t");
        failed.exit_code = 2;
        let out = aggregate_output(&[failed], BlockStyle::TopLevel);
        assert!(out.contains("⚠️ FAILED (exit code 2)"));
    }

    #[test]
    fn empty_output_block_is_flagged_only_without_output_target() {
        let empty = ok_result("a", "   \n");
        let out = aggregate_output(&[empty], BlockStyle::TopLevel);
        assert!(out.contains("⚠️ EMPTY OUTPUT"));

        let mut with_target = ok_result("a", "");
        with_target.output_file = Some(std::path::PathBuf::from("/out.md"));
        let out = aggregate_output(&[with_target], BlockStyle::TopLevel);
        assert!(!out.contains("⚠️ EMPTY OUTPUT"));
    }

    #[test]
    fn chain_style_uses_parallel_task_headers() {
        let out = aggregate_output(&[ok_result("w1", "x")], BlockStyle::InChain);
        assert!(out.contains("=== Parallel Task 1 (w1) ==="));
    }

    #[test]
    fn skipped_block_uses_marker_body() {
        let skipped = StepResult::skipped("w2", "m");
        let out = aggregate_output(&[skipped], BlockStyle::InChain);
        assert!(out.contains("(skipped — fail-fast)"));
    }
}
