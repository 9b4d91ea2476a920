//! Background (detached) execution.
//!
//! `spawn` launches this same executable with the hidden `worker`
//! subcommand in a detached child; `worker` contains the process body
//! that executes the steps and maintains the durable status files;
//! `registry` tracks in-flight jobs for the current session and turns
//! terminal result files into in-process completion events.

pub mod registry;
pub mod worker;

use crate::error::EngineError;
use crate::error::EngineResult;
use overseer_common::ensure_accessible_dir;
use overseer_common::write_json_atomic;
use overseer_protocol::WorkerInput;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use tracing::info;

/// Argv marker the host binary dispatches on to enter the worker body.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Handle to a freshly launched background job.
#[derive(Debug, Clone)]
pub struct BackgroundLaunch {
    pub id: String,
    pub async_dir: PathBuf,
    pub pid: u32,
}

/// Write the worker input file and launch the detached worker process.
///
/// The worker is this executable re-invoked as `<exe> worker <input>`,
/// so embedding hosts must route that argv shape to
/// [`worker::run_worker`].
pub fn spawn(input: &WorkerInput) -> EngineResult<BackgroundLaunch> {
    ensure_accessible_dir(&input.async_dir)?;
    if let Some(parent) = input.result_path.parent() {
        ensure_accessible_dir(parent)?;
    }
    let input_path = input.async_dir.join("input.json");
    write_json_atomic(&input_path, input)?;

    let exe =
        std::env::current_exe().map_err(|e| EngineError::RunnerLaunch(e.to_string()))?;
    let mut command = Command::new(exe);
    command
        .arg(WORKER_SUBCOMMAND)
        .arg(&input_path)
        .current_dir(&input.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        // CREATE_NO_WINDOW | DETACHED_PROCESS
        command.creation_flags(0x0800_0000 | 0x0000_0008);
    }

    let child = command
        .spawn()
        .map_err(|e| EngineError::RunnerLaunch(format!("failed to spawn worker: {e}")))?;
    let pid = child.id();
    // The child is intentionally not waited on; it outlives this call
    // and reports through the status files.
    drop(child);

    info!(id = %input.id, pid, dir = %input.async_dir.display(), "background worker launched");
    Ok(BackgroundLaunch {
        id: input.id.clone(),
        async_dir: input.async_dir.clone(),
        pid,
    })
}
