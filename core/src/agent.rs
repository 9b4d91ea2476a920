//! Agent definitions as consumed by the engine.
//!
//! Definitions are loaded by the store and are immutable at execution
//! time: the engine reads them, applies per-run overrides, and never
//! writes back.

use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

/// Thinking effort requested from the runner, appended to the model id
/// as a `:<level>` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }

    const ALL: [Self; 6] = [
        Self::Off,
        Self::Minimal,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Xhigh,
    ];
}

/// Append the thinking suffix to a model id. A pre-existing `:<level>`
/// suffix on the model wins; `Off` leaves the model untouched.
pub fn apply_thinking_suffix(model: &str, level: ThinkingLevel) -> String {
    if level == ThinkingLevel::Off {
        return model.to_string();
    }
    if let Some((_, tail)) = model.rsplit_once(':')
        && ThinkingLevel::ALL.iter().any(|l| l.as_str() == tail)
    {
        return model.to_string();
    }
    format!("{model}:{}", level.as_str())
}

/// Extension sandbox for a runner invocation.
///
/// `Inherit` passes nothing (the runner uses its own config), `None`
/// passes `--no-extensions`, `Allow` passes one `--extension <path>` per
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionPolicy {
    #[default]
    Inherit,
    None,
    Allow(Vec<PathBuf>),
}

impl ExtensionPolicy {
    /// Wire form used in the worker input file.
    pub fn to_wire(&self) -> Option<Vec<PathBuf>> {
        match self {
            Self::Inherit => None,
            Self::None => Some(Vec::new()),
            Self::Allow(list) => Some(list.clone()),
        }
    }

    pub fn from_wire(wire: Option<Vec<PathBuf>>) -> Self {
        match wire {
            None => Self::Inherit,
            Some(list) if list.is_empty() => Self::None,
            Some(list) => Self::Allow(list),
        }
    }
}

/// Where an agent definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSource {
    Builtin,
    User,
    Project,
}

/// Which store scopes a lookup searches. `Both` means project definitions
/// shadow user definitions on a name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentScope {
    User,
    Project,
    #[default]
    Both,
}

/// A named agent configuration, immutable at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique within its scope.
    pub name: String,

    /// System prompt body (the markdown below the frontmatter).
    #[serde(default)]
    pub system_prompt: String,

    /// Provider-qualified model id, e.g. `acme/fast-1`.
    pub model: String,

    #[serde(default)]
    pub thinking: ThinkingLevel,

    /// Tool allowlist handed to the runner.
    #[serde(default)]
    pub tools: Vec<String>,

    /// MCP tools exposed directly, bypassing the tool proxy. `None`
    /// leaves the runner's own config in effect.
    #[serde(default)]
    pub mcp_direct_tools: Option<Vec<String>>,

    #[serde(default)]
    pub extensions: ExtensionPolicy,

    /// Skill names injected into the system prompt by default.
    #[serde(default)]
    pub skills: Vec<String>,

    /// Default artifact filename for this agent's output.
    #[serde(default)]
    pub output: Option<String>,

    /// Files whose paths are prepended as a `[Read from:]` instruction
    /// when the agent runs in a chain.
    #[serde(default)]
    pub default_reads: Vec<PathBuf>,

    /// Whether chain steps running this agent maintain `progress.md`.
    #[serde(default)]
    pub default_progress: bool,

    #[serde(default = "default_source")]
    pub source: AgentSource,
}

const fn default_source() -> AgentSource {
    AgentSource::User
}

impl AgentDefinition {
    /// Minimal definition used by tests and built-ins.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: String::new(),
            model: model.into(),
            thinking: ThinkingLevel::Off,
            tools: Vec::new(),
            mcp_direct_tools: None,
            extensions: ExtensionPolicy::Inherit,
            skills: Vec::new(),
            output: None,
            default_reads: Vec::new(),
            default_progress: false,
            source: AgentSource::User,
        }
    }
}
