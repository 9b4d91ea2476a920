//! Error taxonomy for the engine.
//!
//! Validation and depth-guard failures are returned to the caller as
//! structured errors with no side effects. Runner misbehavior never
//! surfaces here; it is folded into a failed `StepResult` so a partial
//! aggregate always reaches the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the orchestration engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unknown agent: {name} (available: {})", available.join(", "))]
    UnknownAgent {
        name: String,
        available: Vec<String>,
    },

    #[error("invalid field shape: {0}")]
    Normalize(String),

    #[error(
        "Nested subagent call blocked: depth {depth} reached the limit of {max}. \
         Raise SUBAGENT_MAX_DEPTH to allow deeper nesting."
    )]
    DepthExceeded { depth: u32, max: u32 },

    #[error("chain is empty")]
    EmptyChain,

    #[error("first chain step has no task to run (nothing for {{previous}} to reference)")]
    MissingFirstTask,

    #[error("too many parallel tasks: {count} exceeds the limit of {max}")]
    TooManyParallel { count: usize, max: usize },

    #[error("failed to launch runner: {0}")]
    RunnerLaunch(String),

    #[error("agent store error at {path}: {message}")]
    Store { path: PathBuf, message: String },

    #[error("management error: {0}")]
    Management(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error is a pre-execution validation failure (returned
    /// before any child process is spawned or file is written).
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownAgent { .. }
                | Self::Normalize(_)
                | Self::DepthExceeded { .. }
                | Self::EmptyChain
                | Self::MissingFirstTask
                | Self::TooManyParallel { .. }
        )
    }
}
