//! Input file format for the detached background worker process.
//!
//! The engine fully resolves every sequential step (model with thinking
//! suffix, system prompt with skills injected, `[Write to:]` instruction
//! prepended) before writing this file; the only unresolved token left in a
//! task is the `placeholder` string, which the worker substitutes with the
//! previous step's output as the run progresses.

use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

/// Output truncation limits applied to displayed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_bytes: 200 * 1024,
            max_lines: 5000,
        }
    }
}

/// Artifact persistence switches for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactConfig {
    pub enabled: bool,
    /// Whether to also persist the raw JSONL event stream (capped).
    #[serde(default)]
    pub jsonl: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jsonl: false,
        }
    }
}

/// A fully resolved sequential step, ready to spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStep {
    pub agent: String,
    /// Provider-qualified model id, thinking suffix already applied.
    pub model: String,
    /// System prompt with `<skill>` blocks already injected.
    pub system_prompt: String,
    /// Task text; may still contain the `{previous}` placeholder.
    pub task: String,
    pub tools: Vec<String>,
    /// `None` = inherit, `Some([])` = sandbox (no extensions),
    /// `Some(list)` = allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<PathBuf>>,
    /// `None` = unset, `Some([])` = explicitly disabled (`__none__`),
    /// `Some(list)` = csv allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_direct_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

/// One entry of the worker's flattened-but-typed step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerStep {
    #[serde(rename_all = "camelCase")]
    Parallel {
        parallel: Vec<ResolvedStep>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrency: Option<usize>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        fail_fast: bool,
    },
    Sequential(ResolvedStep),
}

impl WorkerStep {
    /// Number of flattened step rows this entry expands to.
    pub fn flat_len(&self) -> usize {
        match self {
            Self::Sequential(_) => 1,
            Self::Parallel { parallel, .. } => parallel.len(),
        }
    }
}

/// The worker input document, written to disk and passed by path as argv.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInput {
    pub id: String,
    pub steps: Vec<WorkerStep>,
    pub result_path: PathBuf,
    pub cwd: PathBuf,
    /// Literal token substituted with the previous step's output.
    pub placeholder: String,
    #[serde(default)]
    pub max_output: OutputLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub artifact_config: ArtifactConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
    pub async_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl WorkerInput {
    /// Total flattened step count (parallel groups expanded).
    pub fn flat_step_count(&self) -> usize {
        self.steps.iter().map(WorkerStep::flat_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step(agent: &str) -> ResolvedStep {
        ResolvedStep {
            agent: agent.to_string(),
            model: "acme/fast-1".to_string(),
            system_prompt: "be brief".to_string(),
            task: "{previous}".to_string(),
            tools: vec!["read".to_string()],
            extensions: None,
            mcp_direct_tools: None,
            output_file: None,
            skills: vec![],
        }
    }

    #[test]
    fn untagged_steps_distinguish_parallel_from_sequential() {
        let steps = vec![
            WorkerStep::Sequential(step("scout")),
            WorkerStep::Parallel {
                parallel: vec![step("w1"), step("w2")],
                concurrency: Some(2),
                fail_fast: true,
            },
        ];
        let json = serde_json::to_string(&steps).unwrap();
        let back: Vec<WorkerStep> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, steps);
        assert_eq!(back.iter().map(WorkerStep::flat_len).sum::<usize>(), 3);
    }

    #[test]
    fn flat_step_count_expands_groups() {
        let input = WorkerInput {
            id: "x".to_string(),
            steps: vec![
                WorkerStep::Sequential(step("a")),
                WorkerStep::Parallel {
                    parallel: vec![step("b"), step("c"), step("d")],
                    concurrency: None,
                    fail_fast: false,
                },
                WorkerStep::Sequential(step("e")),
            ],
            result_path: PathBuf::from("/tmp/results/x.json"),
            cwd: PathBuf::from("/work"),
            placeholder: "{previous}".to_string(),
            max_output: OutputLimits::default(),
            artifacts_dir: None,
            artifact_config: ArtifactConfig::default(),
            session_dir: None,
            async_dir: PathBuf::from("/tmp/async/x"),
            session_id: None,
        };
        assert_eq!(input.flat_step_count(), 5);
    }
}
