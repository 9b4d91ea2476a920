//! Results surfaced to the caller.

use overseer_protocol::MessageRecord;
use overseer_protocol::RunMode;
use overseer_protocol::TokenUsage;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Caller-level live update callback. Updates for one request are
/// serialized; the engine never invokes it concurrently.
pub type OnUpdate = Arc<dyn Fn(&Details) + Send + Sync>;

/// Exit code for a step skipped by fail-fast.
pub const EXIT_SKIPPED: i32 = -1;
/// Exit code for a cancelled step.
pub const EXIT_CANCELLED: i32 = -2;

/// Why display output was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationReason {
    Bytes,
    Lines,
}

/// Truncation outcome attached to a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationInfo {
    pub was_truncated: bool,
    pub reason: TruncationReason,
    /// Where the untruncated body was written, when artifacts are on.
    pub saved_to_path: Option<PathBuf>,
}

/// Compact per-run accounting shown in live progress and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub tool_count: usize,
    pub tokens: u64,
    pub duration_ms: u64,
}

/// Result of one executed agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub agent: String,
    pub model: String,
    /// Fully resolved task, templates substituted and instructions
    /// prepended.
    pub task: String,
    pub messages: Vec<MessageRecord>,
    /// 0 success, >0 runner failure, -1 skipped by fail-fast, -2
    /// cancelled.
    pub exit_code: i32,
    pub usage: TokenUsage,
    pub progress_summary: ProgressSummary,
    /// Skill names actually injected.
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_paths: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation: Option<TruncationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
    /// Declared output target, when one resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    /// Display output (post-truncation).
    pub output: String,
    /// Non-fatal notices: missing skills, declared-but-absent output
    /// files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepResult {
    pub fn new(agent: impl Into<String>, model: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            model: model.into(),
            task: task.into(),
            messages: Vec::new(),
            exit_code: 0,
            usage: TokenUsage::default(),
            progress_summary: ProgressSummary::default(),
            skills: Vec::new(),
            artifact_paths: None,
            truncation: None,
            error: None,
            session_file: None,
            output_file: None,
            output: String::new(),
            warnings: Vec::new(),
        }
    }

    /// A step that never ran because a fail-fast peer failed first.
    pub fn skipped(agent: impl Into<String>, model: impl Into<String>) -> Self {
        let mut result = Self::new(agent, model, String::new());
        result.exit_code = EXIT_SKIPPED;
        result.output = "(skipped — fail-fast)".to_string();
        result
    }

    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub const fn was_skipped(&self) -> bool {
        self.exit_code == EXIT_SKIPPED
    }
}

/// Live state of one agent slot in a progress vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveState {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

/// Per-agent live progress surfaced through `on_update`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveAgentProgress {
    pub agent: String,
    pub state: LiveState,
    pub tool_count: usize,
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
}

impl LiveAgentProgress {
    pub fn pending(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Self::default()
        }
    }
}

/// Summary of artifacts written for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsSummary {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Aggregate result handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Details {
    pub mode: RunMode,
    pub results: Vec<StepResult>,
    /// Live slots, populated during execution and on the final update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Vec<LiveAgentProgress>>,
    /// Chain step labels; a parallel group is one `"[a+b+c]"` token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_agents: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsSummary>,
    /// Aggregate display output.
    pub output: String,
    /// Operational notes (e.g. a silent background→foreground downgrade).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Details {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            results: Vec::new(),
            progress: None,
            chain_agents: None,
            current_step_index: None,
            total_steps: None,
            async_id: None,
            async_dir: None,
            artifacts: None,
            output: String::new(),
            notes: Vec::new(),
        }
    }

    /// AND of step successes.
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(StepResult::succeeded)
    }
}

/// Encode a chain's step labels, folding a parallel group into one
/// bracketed token.
pub fn chain_agent_labels(steps: &[crate::request::ChainStep]) -> Vec<String> {
    steps
        .iter()
        .map(|step| match step {
            crate::request::ChainStep::Sequential(s) => s.agent.clone(),
            crate::request::ChainStep::Parallel(group) => {
                let names: Vec<&str> = group.tasks.iter().map(|t| t.agent.as_str()).collect();
                format!("[{}]", names.join("+"))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChainStep;
    use crate::request::ParallelGroup;
    use crate::request::RunOverrides;
    use crate::request::SequentialStep;
    use pretty_assertions::assert_eq;

    fn seq(agent: &str) -> SequentialStep {
        SequentialStep {
            agent: agent.to_string(),
            task: None,
            overrides: RunOverrides::default(),
        }
    }

    #[test]
    fn parallel_group_encodes_as_bracket_token() {
        let steps = vec![
            ChainStep::Sequential(seq("scout")),
            ChainStep::Parallel(ParallelGroup {
                tasks: vec![seq("a"), seq("b"), seq("c")],
                concurrency: None,
                fail_fast: false,
            }),
            ChainStep::Sequential(seq("reviewer")),
        ];
        assert_eq!(
            chain_agent_labels(&steps),
            vec!["scout", "[a+b+c]", "reviewer"]
        );
    }

    #[test]
    fn skipped_result_has_marker_body() {
        let result = StepResult::skipped("w2", "acme/fast-1");
        assert_eq!(result.exit_code, EXIT_SKIPPED);
        assert!(result.was_skipped());
        assert_eq!(result.output, "(skipped — fail-fast)");
    }

    #[test]
    fn details_success_is_and_of_steps() {
        let mut details = Details::new(RunMode::Chain);
        details.results.push(StepResult::new("a", "m", "t"));
        assert!(details.succeeded());
        let mut failed = StepResult::new("b", "m", "t");
        failed.exit_code = 2;
        details.results.push(failed);
        assert!(!details.succeeded());
    }
}
