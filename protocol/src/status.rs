//! Durable status protocol for background runs.
//!
//! A background job owns a directory `<asyncRoot>/<id>/` containing
//! `status.json` (the authoritative state machine), `events.jsonl` (an
//! append-only timeline), a human-readable Markdown summary written at
//! completion, and one `output-<stepIndex>.log` per flattened step.
//!
//! State machine:
//! ```text
//! queued -> running -> complete
//!                 \--> failed
//! ```
//! Per step: `pending -> running -> complete | failed`. Parallel groups are
//! expanded so `steps` always has one row per flattened step. The terminal
//! result file is written strictly after the terminal `status.json` write.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::events::TokenUsage;

/// Which execution mode produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Single,
    Parallel,
    Chain,
}

impl RunMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Parallel => "parallel",
            Self::Chain => "chain",
        }
    }
}

/// Job-level state, authoritative in `status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Per-step state inside `status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One flattened step row in `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRow {
    pub agent: String,
    pub status: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
}

impl StepRow {
    pub fn pending(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: StepState::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            exit_code: None,
            tokens: None,
            skills: None,
        }
    }
}

/// The `status.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub run_id: String,
    pub mode: RunMode,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub pid: u32,
    pub cwd: String,
    pub current_step: usize,
    pub steps: Vec<StepRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    /// `current_step` is defined as the lowest-indexed non-complete step.
    pub fn recompute_current_step(&mut self) {
        self.current_step = self
            .steps
            .iter()
            .position(|s| s.status != StepState::Complete)
            .unwrap_or(self.steps.len());
    }

    /// Advance `last_update`, keeping it monotonic even if the clock slips.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Aggregate token count across completed steps.
    pub fn sum_tokens(&self) -> u64 {
        self.steps.iter().filter_map(|s| s.tokens).sum()
    }
}

/// Kinds of entries appended to `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineKind {
    #[serde(rename = "subagent.run.started")]
    RunStarted,
    #[serde(rename = "subagent.run.completed")]
    RunCompleted,
    #[serde(rename = "subagent.run.failed")]
    RunFailed,
    #[serde(rename = "subagent.step.started")]
    StepStarted,
    #[serde(rename = "subagent.step.completed")]
    StepCompleted,
    #[serde(rename = "subagent.step.failed")]
    StepFailed,
}

/// One line of `events.jsonl`. Appends are small enough to be atomic, so
/// writers hold no locks; entries are strictly time-ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub ts: DateTime<Utc>,
    pub event: TimelineKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TimelineEvent {
    pub fn new(event: TimelineKind) -> Self {
        Self {
            ts: Utc::now(),
            event,
            step: None,
            agent: None,
            exit_code: None,
            message: None,
        }
    }

    pub fn step(mut self, index: usize, agent: &str) -> Self {
        self.step = Some(index);
        self.agent = Some(agent.to_string());
        self
    }

    pub const fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// File name helpers for the background layout.
pub mod files {
    pub const STATUS: &str = "status.json";
    pub const EVENTS: &str = "events.jsonl";

    pub fn markdown_log(id: &str) -> String {
        format!("subagent-log-{id}.md")
    }

    pub fn step_output(index: usize) -> String {
        format!("output-{index}.log")
    }

    pub fn result_file(id: &str) -> String {
        format!("{id}.json")
    }
}

/// Convenience used by step rows when a run finishes a step.
pub fn step_tokens(usage: &TokenUsage) -> Option<u64> {
    (usage.total_tokens > 0).then_some(usage.total_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn status_with_steps(states: &[StepState]) -> JobStatus {
        JobStatus {
            run_id: "r1".to_string(),
            mode: RunMode::Chain,
            state: JobState::Running,
            started_at: Utc::now(),
            last_update: Utc::now(),
            ended_at: None,
            pid: 1234,
            cwd: "/tmp".to_string(),
            current_step: 0,
            steps: states
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let mut row = StepRow::pending(format!("agent-{i}"));
                    row.status = *s;
                    row
                })
                .collect(),
            total_tokens: None,
            output_file: None,
            session_dir: None,
            session_file: None,
            error: None,
        }
    }

    #[test]
    fn current_step_is_lowest_non_complete() {
        let mut status = status_with_steps(&[
            StepState::Complete,
            StepState::Complete,
            StepState::Running,
            StepState::Pending,
        ]);
        status.recompute_current_step();
        assert_eq!(status.current_step, 2);
    }

    #[test]
    fn current_step_saturates_when_all_complete() {
        let mut status = status_with_steps(&[StepState::Complete, StepState::Complete]);
        status.recompute_current_step();
        assert_eq!(status.current_step, 2);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut status = status_with_steps(&[StepState::Pending]);
        let later = status.last_update + chrono::Duration::seconds(5);
        status.touch(later);
        assert_eq!(status.last_update, later);
        status.touch(later - chrono::Duration::seconds(60));
        assert_eq!(status.last_update, later);
    }

    #[test]
    fn status_serializes_with_camel_case_keys() {
        let status = status_with_steps(&[StepState::Pending]);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"runId\""));
        assert!(json.contains("\"lastUpdate\""));
        assert!(json.contains("\"currentStep\""));
        assert!(!json.contains("\"run_id\""));
    }

    #[test]
    fn timeline_kind_uses_dotted_names() {
        let event = TimelineEvent::new(TimelineKind::StepFailed)
            .step(3, "reviewer")
            .exit_code(2);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("subagent.step.failed"));
        assert!(json.contains("\"exitCode\":2"));
    }
}
