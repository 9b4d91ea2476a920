//! Subagent orchestration engine for Overseer.
//!
//! The engine dispatches child agent processes (runs of the `pi` coding
//! agent CLI), streams their JSONL output back, persists artifacts, and
//! composes them into larger workflows:
//! - **Single**: one agent, one task
//! - **Parallel**: bounded-concurrency fan-out with ordered results
//! - **Chain**: sequential steps threading `{previous}` output, with
//!   optional parallel fan-out/fan-in inside the chain
//!
//! Every mode runs either in the foreground (live progress through an
//! `on_update` callback) or detached in the background (durable
//! `status.json` on disk, completion announced through a result file
//! picked up by the [`background::registry::BackgroundRegistry`]).

pub mod agent;
pub mod background;
pub mod chain;
pub mod config;
pub mod depth;
pub mod detect;
pub mod engine;
pub mod error;
pub mod manage;
pub mod output;
pub mod parallel;
pub mod request;
pub mod result;
pub mod runner;
pub mod single;
pub mod skills;
pub mod store;

pub use agent::AgentDefinition;
pub use agent::AgentScope;
pub use agent::AgentSource;
pub use agent::ExtensionPolicy;
pub use agent::ThinkingLevel;
pub use agent::apply_thinking_suffix;
pub use background::registry::BackgroundRegistry;
pub use background::registry::EngineEvent;
pub use chain::resolve_templates;
pub use config::EngineConfig;
pub use detect::ErrorDetection;
pub use detect::detect_error;
pub use engine::Engine;
pub use error::EngineError;
pub use error::EngineResult;
pub use manage::AgentPatch;
pub use manage::ManageAction;
pub use manage::ManageOutcome;
pub use request::ChainStep;
pub use request::ExecutionRequest;
pub use request::OutputSpec;
pub use request::ParallelGroup;
pub use request::RequestMode;
pub use request::RunOverrides;
pub use request::SequentialStep;
pub use request::SkillSpec;
pub use request::TaskSpec;
pub use result::Details;
pub use result::LiveAgentProgress;
pub use result::OnUpdate;
pub use result::StepResult;
pub use skills::FsSkillResolver;
pub use skills::SkillResolver;
pub use store::AgentStore;
pub use store::ChainDefinition;
pub use store::FsAgentStore;
pub use store::MemoryStore;
pub use store::StoreScope;
