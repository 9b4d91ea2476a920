//! Runner invocation: executable resolution, argv/env construction, and
//! spawning.
//!
//! The runner is an opaque coding-agent CLI. It takes `-p` plus flags,
//! reads the system prompt from a file, and emits a JSONL event stream on
//! stdout. Long tasks spill to a temp file passed with the runner's
//! `@file` escape; command lines that long break on Windows.

use crate::config::RUNNER_BIN;
use crate::config::TASK_SPILL_BYTES;
use crate::depth;
use crate::error::EngineError;
use overseer_protocol::ResolvedStep;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use which::which;

/// Marker value for `MCP_DIRECT_TOOLS` that explicitly disables direct
/// tools (as opposed to the variable being absent, which means "no
/// config").
pub const MCP_NONE_SENTINEL: &str = "__none__";
pub const MCP_TOOLS_ENV: &str = "MCP_DIRECT_TOOLS";

/// Locate the runner executable.
///
/// Order: explicit override, PATH lookup, then a walk up from this
/// executable's directory looking for a sibling install (package-root
/// layouts place the runner next to or above the engine).
pub fn resolve_runner_bin(explicit: Option<&Path>) -> Result<PathBuf, EngineError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(EngineError::RunnerLaunch(format!(
            "configured runner not found: {}",
            path.display()
        )));
    }

    if let Ok(path) = which(RUNNER_BIN) {
        return Ok(path);
    }

    let exe_name = if cfg!(windows) {
        format!("{RUNNER_BIN}.exe")
    } else {
        RUNNER_BIN.to_string()
    };
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        while let Some(d) = dir {
            let candidate = d.join(&exe_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
            dir = d.parent();
        }
    }

    Err(EngineError::RunnerLaunch(format!(
        "runner executable `{RUNNER_BIN}` not found on PATH"
    )))
}

/// A ready-to-spawn runner command. Holds the temp files backing the
/// system prompt and any spilled task so they outlive the child.
pub struct PreparedRunner {
    command: Command,
    _prompt_file: NamedTempFile,
    _task_file: Option<NamedTempFile>,
}

impl std::fmt::Debug for PreparedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRunner").finish_non_exhaustive()
    }
}

impl PreparedRunner {
    pub fn spawn(mut self) -> Result<(Child, RunnerGuard), EngineError> {
        let child = self
            .command
            .spawn()
            .map_err(|e| EngineError::RunnerLaunch(e.to_string()))?;
        Ok((
            child,
            RunnerGuard {
                _prompt_file: self._prompt_file,
                _task_file: self._task_file,
            },
        ))
    }
}

/// Keeps spill files alive for the lifetime of the child process.
#[derive(Debug)]
pub struct RunnerGuard {
    _prompt_file: NamedTempFile,
    _task_file: Option<NamedTempFile>,
}

/// Build the runner invocation for a fully resolved step.
pub fn prepare_runner(
    runner_bin: &Path,
    step: &ResolvedStep,
    cwd: &Path,
    session_dir: Option<&Path>,
) -> Result<PreparedRunner, EngineError> {
    let mut prompt_file = NamedTempFile::new()?;
    prompt_file.write_all(step.system_prompt.as_bytes())?;
    prompt_file.flush()?;

    let mut command = Command::new(runner_bin);
    command.arg("-p");

    match session_dir {
        Some(dir) => {
            command.arg("--session-dir").arg(dir);
        }
        None => {
            command.arg("--no-session");
        }
    }

    command.arg("--models").arg(&step.model);

    if !step.tools.is_empty() {
        command.arg("--tools").arg(step.tools.join(","));
    }

    match &step.extensions {
        None => {}
        Some(list) if list.is_empty() => {
            command.arg("--no-extensions");
        }
        Some(list) => {
            for ext in list {
                command.arg("--extension").arg(ext);
            }
        }
    }

    command.arg("--append-system-prompt").arg(prompt_file.path());

    // Inline short tasks; spill long ones to a file the runner reads
    // through its @file escape.
    let task_file = if step.task.len() > TASK_SPILL_BYTES {
        let mut file = NamedTempFile::new()?;
        file.write_all(step.task.as_bytes())?;
        file.flush()?;
        command.arg(format!("@{}", file.path().display()));
        Some(file)
    } else {
        command.arg(&step.task);
        None
    };

    match &step.mcp_direct_tools {
        None => {}
        Some(list) if list.is_empty() => {
            command.env(MCP_TOOLS_ENV, MCP_NONE_SENTINEL);
        }
        Some(list) => {
            command.env(MCP_TOOLS_ENV, list.join(","));
        }
    }
    command.env(depth::DEPTH_ENV, depth::child_depth().to_string());

    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW: children must not flash a console.
        command.creation_flags(0x0800_0000);
    }

    debug!(agent = %step.agent, model = %step.model, "prepared runner invocation");
    Ok(PreparedRunner {
        command,
        _prompt_file: prompt_file,
        _task_file: task_file,
    })
}

/// Ask the child to terminate gracefully. On unix this is SIGTERM; on
/// Windows there is no graceful signal, so the caller falls through to
/// the hard kill after the grace period.
pub fn terminate(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a pid we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_protocol::ResolvedStep;

    fn step(task: &str) -> ResolvedStep {
        ResolvedStep {
            agent: "scout".to_string(),
            model: "acme/fast-1:low".to_string(),
            system_prompt: "be quick".to_string(),
            task: task.to_string(),
            tools: vec!["read".to_string(), "grep".to_string()],
            extensions: Some(Vec::new()),
            mcp_direct_tools: Some(Vec::new()),
            output_file: None,
            skills: vec![],
        }
    }

    fn argv(prepared: &PreparedRunner) -> Vec<String> {
        prepared
            .command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn short_task_is_passed_inline() {
        let prepared =
            prepare_runner(Path::new("/bin/true"), &step("hello"), Path::new("/tmp"), None)
                .unwrap();
        let args = argv(&prepared);
        assert!(args.contains(&"hello".to_string()));
        assert!(args.contains(&"--no-session".to_string()));
        assert!(args.contains(&"--no-extensions".to_string()));
        assert!(args.contains(&"read,grep".to_string()));
    }

    #[test]
    fn long_task_spills_to_at_file() {
        let long = "x".repeat(TASK_SPILL_BYTES + 1);
        let prepared =
            prepare_runner(Path::new("/bin/true"), &step(&long), Path::new("/tmp"), None).unwrap();
        let args = argv(&prepared);
        let at_arg = args.iter().find(|a| a.starts_with('@')).unwrap();
        let spilled = std::fs::read_to_string(&at_arg[1..]).unwrap();
        assert_eq!(spilled, long);
        assert!(!args.contains(&long));
    }

    #[test]
    fn empty_mcp_list_sets_sentinel() {
        let prepared =
            prepare_runner(Path::new("/bin/true"), &step("t"), Path::new("/tmp"), None).unwrap();
        let envs: Vec<(String, String)> = prepared
            .command
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| {
                Some((
                    k.to_string_lossy().into_owned(),
                    v?.to_string_lossy().into_owned(),
                ))
            })
            .collect();
        assert!(envs.contains(&(MCP_TOOLS_ENV.to_string(), MCP_NONE_SENTINEL.to_string())));
        assert!(envs.iter().any(|(k, _)| k == depth::DEPTH_ENV));
    }

    #[test]
    fn explicit_missing_runner_is_a_launch_error() {
        let err = resolve_runner_bin(Some(Path::new("/definitely/not/here"))).unwrap_err();
        assert!(matches!(err, EngineError::RunnerLaunch(_)));
    }

    #[test]
    fn session_dir_switches_the_session_flag() {
        let prepared = prepare_runner(
            Path::new("/bin/true"),
            &step("t"),
            Path::new("/tmp"),
            Some(Path::new("/sessions/s1")),
        )
        .unwrap();
        let args = argv(&prepared);
        assert!(args.contains(&"--session-dir".to_string()));
        assert!(!args.contains(&"--no-session".to_string()));
    }
}
