//! Execution requests and boundary normalization.
//!
//! Callers hand the dispatcher loosely-shaped values for `skill`,
//! `output`, `reads` and chain items (string | list | bool | absent).
//! Everything is normalized here, at the boundary, into tagged unions;
//! any bad shape maps to the single `EngineError::Normalize` kind.

use crate::agent::AgentScope;
use crate::error::EngineError;
use overseer_protocol::ArtifactConfig;
use overseer_protocol::OutputLimits;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

/// Skill selection for a run: inherit the agent default, disable
/// entirely, or use an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SkillSpec {
    #[default]
    Inherit,
    Disabled,
    Explicit(Vec<String>),
}

impl SkillSpec {
    /// Normalize the loose union: absent/`true` → inherit, `false` →
    /// disabled, string → one skill, list of strings → explicit.
    pub fn from_value(value: Option<&Value>) -> Result<Self, EngineError> {
        match value {
            None | Some(Value::Null) | Some(Value::Bool(true)) => Ok(Self::Inherit),
            Some(Value::Bool(false)) => Ok(Self::Disabled),
            Some(Value::String(s)) => Ok(Self::Explicit(vec![s.clone()])),
            Some(Value::Array(items)) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => names.push(s.clone()),
                        other => {
                            return Err(EngineError::Normalize(format!(
                                "skill list entries must be strings, got {other}"
                            )));
                        }
                    }
                }
                Ok(Self::Explicit(names))
            }
            Some(other) => Err(EngineError::Normalize(format!(
                "skill must be a string, list, or boolean, got {other}"
            ))),
        }
    }

    /// Resolve against the agent's default skill list.
    pub fn resolve<'a>(&'a self, agent_default: &'a [String]) -> &'a [String] {
        match self {
            Self::Inherit => agent_default,
            Self::Disabled => &[],
            Self::Explicit(names) => names,
        }
    }
}

/// Output artifact selection for a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputSpec {
    #[default]
    Inherit,
    Disabled,
    Path(String),
}

impl OutputSpec {
    pub fn from_value(value: Option<&Value>) -> Result<Self, EngineError> {
        match value {
            None | Some(Value::Null) | Some(Value::Bool(true)) => Ok(Self::Inherit),
            Some(Value::Bool(false)) => Ok(Self::Disabled),
            Some(Value::String(s)) => Ok(Self::Path(s.clone())),
            Some(other) => Err(EngineError::Normalize(format!(
                "output must be a string or boolean, got {other}"
            ))),
        }
    }

    /// Resolve to a filename: explicit path wins, inherit falls back to
    /// the agent default, disabled is `None`.
    pub fn resolve(&self, agent_default: Option<&str>) -> Option<String> {
        match self {
            Self::Inherit => agent_default.map(str::to_string),
            Self::Disabled => None,
            Self::Path(p) => Some(p.clone()),
        }
    }
}

/// Normalize a loose `reads` union into a path list.
pub fn reads_from_value(value: Option<&Value>) -> Result<Option<Vec<PathBuf>>, EngineError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(false)) => Ok(Some(Vec::new())),
        Some(Value::String(s)) => Ok(Some(vec![PathBuf::from(s)])),
        Some(Value::Array(items)) => {
            let mut paths = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => paths.push(PathBuf::from(s)),
                    other => {
                        return Err(EngineError::Normalize(format!(
                            "reads entries must be strings, got {other}"
                        )));
                    }
                }
            }
            Ok(Some(paths))
        }
        Some(other) => Err(EngineError::Normalize(format!(
            "reads must be a string, list, or false, got {other}"
        ))),
    }
}

/// Per-run overrides layered over the agent defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub skills: SkillSpec,
    #[serde(default)]
    pub output: OutputSpec,
    /// `None` inherits the agent's `default_reads`.
    #[serde(default)]
    pub reads: Option<Vec<PathBuf>>,
    /// `None` inherits the agent's `default_progress`.
    #[serde(default)]
    pub progress: Option<bool>,
}

/// One task of a parallel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub agent: String,
    pub task: String,
    #[serde(default)]
    pub overrides: RunOverrides,
}

/// A sequential chain step. `task` defaults to `"{previous}"` when
/// absent (except for the first step, which must be explicit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialStep {
    pub agent: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub overrides: RunOverrides,
}

/// A parallel fan-out/fan-in group inside a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub tasks: Vec<SequentialStep>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
}

/// One step of a chain request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainStep {
    Sequential(SequentialStep),
    Parallel(ParallelGroup),
}

impl ChainStep {
    /// Number of flattened step rows this step expands to.
    pub fn flat_len(&self) -> usize {
        match self {
            Self::Sequential(_) => 1,
            Self::Parallel(group) => group.tasks.len(),
        }
    }

    /// Agent names referenced by this step.
    pub fn agents(&self) -> Vec<&str> {
        match self {
            Self::Sequential(step) => vec![step.agent.as_str()],
            Self::Parallel(group) => group.tasks.iter().map(|t| t.agent.as_str()).collect(),
        }
    }
}

/// Normalize loose per-step override fields out of a JSON object.
pub fn overrides_from_value(obj: &serde_json::Map<String, Value>) -> Result<RunOverrides, EngineError> {
    Ok(RunOverrides {
        model: match obj.get("model") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(EngineError::Normalize(format!(
                    "model must be a string, got {other}"
                )));
            }
        },
        skills: SkillSpec::from_value(obj.get("skill").or_else(|| obj.get("skills")))?,
        output: OutputSpec::from_value(obj.get("output"))?,
        reads: reads_from_value(obj.get("reads"))?,
        progress: match obj.get("progress") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                return Err(EngineError::Normalize(format!(
                    "progress must be a boolean, got {other}"
                )));
            }
        },
    })
}

fn sequential_from_value(obj: &serde_json::Map<String, Value>) -> Result<SequentialStep, EngineError> {
    let agent = match obj.get("agent") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(EngineError::Normalize(
                "chain step is missing an agent name".to_string(),
            ));
        }
    };
    let task = match obj.get("task") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(EngineError::Normalize(format!(
                "task must be a string, got {other}"
            )));
        }
    };
    Ok(SequentialStep {
        agent,
        task,
        overrides: overrides_from_value(obj)?,
    })
}

/// Normalize a loose chain item list (the caller-facing `ChainItem`
/// shapes) into typed steps.
pub fn chain_steps_from_value(value: &Value) -> Result<Vec<ChainStep>, EngineError> {
    let Value::Array(items) = value else {
        return Err(EngineError::Normalize(format!(
            "chain must be a list of steps, got {value}"
        )));
    };
    let mut steps = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(obj) = item else {
            return Err(EngineError::Normalize(format!(
                "chain step must be an object, got {item}"
            )));
        };
        if let Some(parallel) = obj.get("parallel") {
            let Value::Array(inner) = parallel else {
                return Err(EngineError::Normalize(format!(
                    "parallel must be a list of steps, got {parallel}"
                )));
            };
            let mut tasks = Vec::with_capacity(inner.len());
            for entry in inner {
                let Value::Object(inner_obj) = entry else {
                    return Err(EngineError::Normalize(format!(
                        "parallel step entry must be an object, got {entry}"
                    )));
                };
                tasks.push(sequential_from_value(inner_obj)?);
            }
            let concurrency = match obj.get("concurrency") {
                None | Some(Value::Null) => None,
                Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
                Some(other) => {
                    return Err(EngineError::Normalize(format!(
                        "concurrency must be a number, got {other}"
                    )));
                }
            };
            let fail_fast = match obj.get("failFast").or_else(|| obj.get("fail_fast")) {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => *b,
                Some(other) => {
                    return Err(EngineError::Normalize(format!(
                        "failFast must be a boolean, got {other}"
                    )));
                }
            };
            steps.push(ChainStep::Parallel(ParallelGroup {
                tasks,
                concurrency,
                fail_fast,
            }));
        } else {
            steps.push(ChainStep::Sequential(sequential_from_value(obj)?));
        }
    }
    Ok(steps)
}

/// Which of the three execution shapes was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestMode {
    Single {
        agent: String,
        task: String,
        #[serde(default)]
        overrides: RunOverrides,
    },
    Parallel {
        tasks: Vec<TaskSpec>,
    },
    Chain {
        steps: Vec<ChainStep>,
        /// Initial task substituted for `{task}` in step templates.
        #[serde(default)]
        task: Option<String>,
    },
}

/// A fully-formed request to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub mode: RequestMode,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Final clarify decision from the upstream TUI; the engine only
    /// observes it to gate background mode.
    #[serde(default)]
    pub clarify: bool,
    /// Foreground (false) vs detached background (true).
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub max_output: Option<OutputLimits>,
    #[serde(default)]
    pub artifacts: Option<ArtifactConfig>,
    /// Explicit persistent chain directory; exempt from the startup sweep.
    #[serde(default)]
    pub chain_dir: Option<PathBuf>,
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    #[serde(default)]
    pub agent_scope: AgentScope,
}

impl ExecutionRequest {
    pub fn single(agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(RequestMode::Single {
            agent: agent.into(),
            task: task.into(),
            overrides: RunOverrides::default(),
        })
    }

    pub fn parallel(tasks: Vec<TaskSpec>) -> Self {
        Self::new(RequestMode::Parallel { tasks })
    }

    pub fn chain(steps: Vec<ChainStep>, task: Option<String>) -> Self {
        Self::new(RequestMode::Chain { steps, task })
    }

    pub fn new(mode: RequestMode) -> Self {
        Self {
            mode,
            cwd: None,
            clarify: false,
            background: false,
            max_output: None,
            artifacts: None,
            chain_dir: None,
            session_dir: None,
            agent_scope: AgentScope::Both,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn skill_union_shapes() {
        assert_eq!(SkillSpec::from_value(None).unwrap(), SkillSpec::Inherit);
        assert_eq!(
            SkillSpec::from_value(Some(&json!(true))).unwrap(),
            SkillSpec::Inherit
        );
        assert_eq!(
            SkillSpec::from_value(Some(&json!(false))).unwrap(),
            SkillSpec::Disabled
        );
        assert_eq!(
            SkillSpec::from_value(Some(&json!("rust"))).unwrap(),
            SkillSpec::Explicit(vec!["rust".to_string()])
        );
        assert_eq!(
            SkillSpec::from_value(Some(&json!(["a", "b"]))).unwrap(),
            SkillSpec::Explicit(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn bad_skill_shape_is_a_normalize_error() {
        let err = SkillSpec::from_value(Some(&json!(42))).unwrap_err();
        assert!(matches!(err, EngineError::Normalize(_)));
        let err = SkillSpec::from_value(Some(&json!([1, 2]))).unwrap_err();
        assert!(matches!(err, EngineError::Normalize(_)));
    }

    #[test]
    fn output_union_shapes() {
        assert_eq!(OutputSpec::from_value(None).unwrap(), OutputSpec::Inherit);
        assert_eq!(
            OutputSpec::from_value(Some(&json!(false))).unwrap(),
            OutputSpec::Disabled
        );
        assert_eq!(
            OutputSpec::from_value(Some(&json!("notes.md"))).unwrap(),
            OutputSpec::Path("notes.md".to_string())
        );
    }

    #[test]
    fn output_resolution_precedence() {
        let agent_default = Some("report.md");
        assert_eq!(
            OutputSpec::Inherit.resolve(agent_default),
            Some("report.md".to_string())
        );
        assert_eq!(OutputSpec::Disabled.resolve(agent_default), None);
        assert_eq!(
            OutputSpec::Path("own.md".to_string()).resolve(agent_default),
            Some("own.md".to_string())
        );
    }

    #[test]
    fn reads_union_shapes() {
        assert_eq!(reads_from_value(None).unwrap(), None);
        assert_eq!(
            reads_from_value(Some(&json!(false))).unwrap(),
            Some(Vec::new())
        );
        assert_eq!(
            reads_from_value(Some(&json!("ctx.md"))).unwrap(),
            Some(vec![PathBuf::from("ctx.md")])
        );
    }

    #[test]
    fn chain_items_normalize_from_loose_json() {
        let value = json!([
            {"agent": "scout", "task": "scan {task}", "skill": "rust"},
            {"parallel": [
                {"agent": "w1", "task": "{previous}"},
                {"agent": "w2"}
            ], "concurrency": 2, "failFast": true},
            {"agent": "reviewer", "output": false}
        ]);
        let steps = chain_steps_from_value(&value).unwrap();
        assert_eq!(steps.len(), 3);
        match &steps[0] {
            ChainStep::Sequential(s) => {
                assert_eq!(s.agent, "scout");
                assert_eq!(
                    s.overrides.skills,
                    SkillSpec::Explicit(vec!["rust".to_string()])
                );
            }
            other => panic!("unexpected step: {other:?}"),
        }
        match &steps[1] {
            ChainStep::Parallel(group) => {
                assert_eq!(group.tasks.len(), 2);
                assert_eq!(group.concurrency, Some(2));
                assert!(group.fail_fast);
            }
            other => panic!("unexpected step: {other:?}"),
        }
        match &steps[2] {
            ChainStep::Sequential(s) => {
                assert_eq!(s.overrides.output, OutputSpec::Disabled);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn bad_chain_item_shape_is_a_normalize_error() {
        assert!(matches!(
            chain_steps_from_value(&json!("not a list")).unwrap_err(),
            EngineError::Normalize(_)
        ));
        assert!(matches!(
            chain_steps_from_value(&json!([{"task": "missing agent"}])).unwrap_err(),
            EngineError::Normalize(_)
        ));
        assert!(matches!(
            chain_steps_from_value(&json!([{"parallel": "nope"}])).unwrap_err(),
            EngineError::Normalize(_)
        ));
    }

    #[test]
    fn chain_step_flattening() {
        let step = ChainStep::Parallel(ParallelGroup {
            tasks: vec![
                SequentialStep {
                    agent: "a".to_string(),
                    task: None,
                    overrides: RunOverrides::default(),
                },
                SequentialStep {
                    agent: "b".to_string(),
                    task: None,
                    overrides: RunOverrides::default(),
                },
            ],
            concurrency: None,
            fail_fast: false,
        });
        assert_eq!(step.flat_len(), 2);
        assert_eq!(step.agents(), vec!["a", "b"]);
    }
}
