//! Durable file formats and runner wire events for Overseer.
//!
//! This crate holds the serde types shared between the engine process and
//! the detached background worker process:
//! - the JSONL event stream emitted by the runner executable on stdout,
//! - the `status.json` / `events.jsonl` files of a background run,
//! - the terminal result file deposited under the results directory,
//! - the worker input file handed to the detached process.
//!
//! Everything here is plain data. Behavior lives in `overseer-core`.

pub mod events;
pub mod result;
pub mod status;
pub mod worker;

pub use events::ContentPart;
pub use events::MessageRecord;
pub use events::RunnerEvent;
pub use events::TokenUsage;
pub use events::ToolCallRecord;
pub use result::JobResult;
pub use result::JobStepResult;
pub use status::JobState;
pub use status::JobStatus;
pub use status::RunMode;
pub use status::StepRow;
pub use status::StepState;
pub use status::TimelineEvent;
pub use status::TimelineKind;
pub use worker::ArtifactConfig;
pub use worker::OutputLimits;
pub use worker::ResolvedStep;
pub use worker::WorkerInput;
pub use worker::WorkerStep;
