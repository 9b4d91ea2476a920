//! Single-agent execution: resolve overrides, spawn the runner, stream
//! its event feed, finalize a `StepResult`.

use crate::agent::AgentDefinition;
use crate::agent::apply_thinking_suffix;
use crate::config::KILL_GRACE;
use crate::config::UPDATE_THROTTLE;
use crate::detect::detect_error;
use crate::output::ArtifactMeta;
use crate::output::ArtifactWriter;
use crate::output::append_history;
use crate::output::truncate_display;
use crate::request::RunOverrides;
use crate::result::EXIT_CANCELLED;
use crate::result::LiveAgentProgress;
use crate::result::LiveState;
use crate::result::ProgressSummary;
use crate::result::StepResult;
use crate::runner;
use chrono::Utc;
use overseer_protocol::ContentPart;
use overseer_protocol::MessageRecord;
use overseer_protocol::OutputLimits;
use overseer_protocol::ResolvedStep;
use overseer_protocol::RunnerEvent;
use overseer_protocol::TokenUsage;
use overseer_protocol::ToolCallRecord;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Per-run live progress callback. Calls are serialized: the streaming
/// loop is sequential, so no two updates for one run ever overlap.
pub type ProgressFn = Arc<dyn Fn(&LiveAgentProgress) + Send + Sync>;

/// Everything the executor needs besides the step itself.
pub struct ExecEnv<'a> {
    pub runner_bin: &'a Path,
    pub cwd: &'a Path,
    pub session_dir: Option<&'a Path>,
    pub limits: OutputLimits,
    pub artifacts: Option<&'a ArtifactWriter>,
    pub progress: Option<&'a ProgressFn>,
    pub cancel: &'a CancellationToken,
    /// When set, raw stdout lines and the stderr tail are appended here
    /// (background runs stream each step to `output-<i>.log`).
    pub stream_log: Option<&'a Path>,
}

/// Layer per-run overrides onto the agent and produce a spawn-ready step.
pub fn resolve_step(
    agent: &AgentDefinition,
    task: &str,
    overrides: &RunOverrides,
    skills: &dyn crate::skills::SkillResolver,
    cwd: &Path,
) -> (ResolvedStep, Vec<String>) {
    let base_model = overrides.model.as_deref().unwrap_or(&agent.model);
    let model = apply_thinking_suffix(base_model, agent.thinking);

    let skill_names = overrides.skills.resolve(&agent.skills);
    let injected = crate::skills::inject_skills(&agent.system_prompt, skill_names, skills);
    let warnings = injected.warnings;

    let output_file = overrides
        .output
        .resolve(agent.output.as_deref())
        .map(|name| {
            let path = PathBuf::from(&name);
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        });

    let reads: &[PathBuf] = overrides.reads.as_deref().unwrap_or(&agent.default_reads);
    let reads_abs: Vec<PathBuf> = reads
        .iter()
        .map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                cwd.join(p)
            }
        })
        .collect();

    let mut prefix = String::new();
    if !reads_abs.is_empty() {
        let joined = reads_abs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        prefix.push_str(&format!("[Read from: {joined}]\n"));
    }
    if let Some(out) = &output_file {
        prefix.push_str(&format!("[Write to: {}]\n", out.display()));
    }

    let step = ResolvedStep {
        agent: agent.name.clone(),
        model,
        system_prompt: injected.system_prompt,
        task: format!("{prefix}{task}"),
        tools: agent.tools.clone(),
        extensions: agent.extensions.to_wire(),
        mcp_direct_tools: agent.mcp_direct_tools.clone(),
        output_file,
        skills: injected.resolved,
    };
    (step, warnings)
}

/// Throttles progress emission to one update per window, with forced
/// flushes on tool boundaries and completion.
struct Throttle {
    last_emit: Option<Instant>,
}

impl Throttle {
    const fn new() -> Self {
        Self { last_emit: None }
    }

    fn should_emit(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= UPDATE_THROTTLE);
        if force || due {
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}

async fn kill_timer(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Execute one resolved step. Never fails: every failure mode is folded
/// into the returned `StepResult`.
pub async fn run_resolved(
    env: &ExecEnv<'_>,
    step: &ResolvedStep,
    artifact_index: Option<usize>,
) -> StepResult {
    let started = Instant::now();
    let started_at = Utc::now();
    let mut result = StepResult::new(&step.agent, &step.model, &step.task);
    result.skills.clone_from(&step.skills);
    result.output_file.clone_from(&step.output_file);

    let mut live = LiveAgentProgress {
        agent: step.agent.clone(),
        state: LiveState::Running,
        ..LiveAgentProgress::default()
    };
    let mut throttle = Throttle::new();
    let emit = |live: &LiveAgentProgress| {
        if let Some(cb) = env.progress {
            cb(live);
        }
    };
    emit(&live);

    let prepared = match runner::prepare_runner(env.runner_bin, step, env.cwd, env.session_dir) {
        Ok(p) => p,
        Err(e) => {
            result.exit_code = 1;
            result.error = Some(e.to_string());
            live.state = LiveState::Failed;
            emit(&live);
            return result;
        }
    };
    let (mut child, _guard) = match prepared.spawn() {
        Ok(pair) => pair,
        Err(e) => {
            result.exit_code = 1;
            result.error = Some(e.to_string());
            live.state = LiveState::Failed;
            emit(&live);
            return result;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let mut jsonl_sink = env
        .artifacts
        .and_then(|w| w.jsonl_sink(&step.agent, artifact_index));
    let mut stream_log = env.stream_log.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    let mut usage = TokenUsage::default();
    let mut messages: Vec<MessageRecord> = Vec::new();
    let mut cancelled = false;
    let mut kill_deadline: Option<tokio::time::Instant> = None;

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                biased;
                () = env.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    runner::terminate(&child);
                    kill_deadline = Some(tokio::time::Instant::now() + KILL_GRACE);
                }
                () = kill_timer(kill_deadline), if kill_deadline.is_some() => {
                    let _ = child.start_kill();
                    kill_deadline = None;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(sink) = jsonl_sink.as_mut() {
                                sink.write_line(&line);
                            }
                            if let Some(log) = stream_log.as_mut() {
                                use std::io::Write;
                                let _ = writeln!(log, "{line}");
                            }
                            let Ok(event) = serde_json::from_str::<RunnerEvent>(&line) else {
                                debug!(agent = %step.agent, "skipping undecodable runner line");
                                continue;
                            };
                            let force = handle_event(event, &mut messages, &mut usage, &mut live);
                            if throttle.should_emit(force) {
                                live.tokens = usage.total_tokens;
                                emit(&live);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(agent = %step.agent, error = %e, "runner stdout read failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    let status = child.wait().await;
    let stderr_text = stderr_task.await.unwrap_or_default();
    if let Some(log) = stream_log.as_mut()
        && !stderr_text.is_empty()
    {
        use std::io::Write;
        let _ = writeln!(log, "--- stderr ---\n{}", stderr_text.trim_end());
    }

    result.messages = messages;
    result.usage = usage;
    result.exit_code = if cancelled {
        EXIT_CANCELLED
    } else {
        status.as_ref().ok().and_then(|s| s.code()).unwrap_or(1)
    };
    if cancelled {
        result.error = Some("cancelled".to_string());
    } else if result.exit_code != 0 {
        let lines: Vec<&str> = stderr_text.lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("\n");
        result.error = Some(if tail.is_empty() {
            format!("runner exited with code {}", result.exit_code)
        } else {
            format!("runner exited with code {}: {tail}", result.exit_code)
        });
    }

    // A clean exit can still hide a trailing tool failure the agent
    // never recovered from.
    if result.exit_code == 0 {
        let detection = detect_error(&result.messages);
        if detection.has_error {
            result.exit_code = 1;
            result.error = detection.reason;
        }
    }

    let raw_output = assistant_text(&result.messages);

    result.progress_summary = ProgressSummary {
        tool_count: live.tool_count,
        tokens: result.usage.total_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    if let Some(expected) = &step.output_file
        && !expected.exists()
    {
        result.warnings.push(format!(
            "declared output file was not produced: {}",
            expected.display()
        ));
    }

    let mut saved_to = None;
    if let Some(writer) = env.artifacts
        && writer.enabled()
    {
        let meta = ArtifactMeta {
            agent: step.agent.clone(),
            model: step.model.clone(),
            exit_code: result.exit_code,
            started_at,
            ended_at: Utc::now(),
            usage: result.usage,
            skills: result.skills.clone(),
        };
        match writer.write(&step.agent, artifact_index, &step.task, &raw_output, &meta) {
            Ok(paths) if !paths.is_empty() => {
                saved_to = Some(writer.output_path(&step.agent, artifact_index));
                result.artifact_paths = Some(paths);
            }
            Ok(_) => {}
            Err(e) => warn!(agent = %step.agent, error = %e, "artifact write failed"),
        }
    }

    let truncated = truncate_display(&raw_output, env.limits, saved_to.as_deref());
    result.output = truncated.text;
    result.truncation = truncated.info;

    live.state = if result.exit_code == 0 {
        LiveState::Done
    } else {
        LiveState::Failed
    };
    live.tokens = result.usage.total_tokens;
    live.current_tool = None;
    emit(&live);

    append_history(
        env.session_dir,
        &step.agent,
        &step.task,
        result.exit_code,
        &result.progress_summary,
    );

    result
}

/// Fold a runner event into the transcript. Returns whether the update
/// throttle should be bypassed.
fn handle_event(
    event: RunnerEvent,
    messages: &mut Vec<MessageRecord>,
    usage: &mut TokenUsage,
    live: &mut LiveAgentProgress,
) -> bool {
    match event {
        RunnerEvent::MessageEnd {
            content,
            usage: turn_usage,
        } => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for part in content {
                match part {
                    ContentPart::Text { text: t } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&t);
                    }
                    ContentPart::ToolCall {
                        tool,
                        call_id,
                        arguments,
                    } => tool_calls.push(ToolCallRecord {
                        tool,
                        call_id,
                        arguments,
                    }),
                }
            }
            messages.push(MessageRecord::Assistant { text, tool_calls });
            if let Some(u) = turn_usage {
                usage.add(&u);
            }
            false
        }
        RunnerEvent::ToolExecutionStart { tool, .. } => {
            live.tool_count += 1;
            live.current_tool = Some(tool);
            true
        }
        RunnerEvent::ToolExecutionEnd { .. } => {
            live.current_tool = None;
            true
        }
        RunnerEvent::ToolResultEnd {
            tool,
            output,
            is_error,
            ..
        } => {
            messages.push(MessageRecord::ToolResult {
                tool,
                output,
                is_error,
            });
            false
        }
    }
}

/// Concatenated assistant text, the run's display output.
fn assistant_text(messages: &[MessageRecord]) -> String {
    let mut out = String::new();
    for record in messages {
        if let MessageRecord::Assistant { text, .. } = record
            && !text.trim().is_empty()
        {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(text.trim_end());
        }
    }
    out
}
