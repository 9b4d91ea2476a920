//! Process-wide nesting guard.
//!
//! Every spawned runner inherits `SUBAGENT_DEPTH` incremented by one, so
//! an agent that tries to orchestrate further subagents is cut off once
//! the cap is reached. The cap defaults to 2 and can be raised (or
//! disabled with 0) through `SUBAGENT_MAX_DEPTH`.

use crate::error::EngineError;
use std::env;

/// Set by the engine in every child environment; never by users.
pub const DEPTH_ENV: &str = "SUBAGENT_DEPTH";
/// User-set override for the nesting cap. 0 disables the guard.
pub const MAX_DEPTH_ENV: &str = "SUBAGENT_MAX_DEPTH";

const DEFAULT_MAX_DEPTH: u32 = 2;

/// Depth of the current process. Unset or garbage parses as 0.
pub fn current_depth() -> u32 {
    env::var(DEPTH_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Effective nesting cap for the current process.
pub fn max_depth() -> u32 {
    env::var(MAX_DEPTH_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_MAX_DEPTH)
}

/// Depth value to place in a spawned child's environment.
pub fn child_depth() -> u32 {
    current_depth() + 1
}

/// Fail when the current process is already at or past the cap.
pub fn check() -> Result<(), EngineError> {
    let max = max_depth();
    if max == 0 {
        return Ok(());
    }
    let depth = current_depth();
    if depth >= max {
        Err(EngineError::DepthExceeded { depth, max })
    } else {
        Ok(())
    }
}

/// Serializes tests that mutate process-wide environment variables.
#[cfg(test)]
pub(crate) static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn depth_guard_env_behavior() {
        let _env = ENV_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        unsafe {
            env::remove_var(DEPTH_ENV);
            env::remove_var(MAX_DEPTH_ENV);
        }
        assert_eq!(current_depth(), 0);
        assert_eq!(max_depth(), DEFAULT_MAX_DEPTH);
        assert_eq!(child_depth(), 1);
        assert!(check().is_ok());

        unsafe {
            env::set_var(DEPTH_ENV, "2");
        }
        let err = check().unwrap_err();
        assert!(
            err.to_string().contains("Nested subagent call blocked"),
            "unexpected message: {err}"
        );

        // Raising the cap unblocks.
        unsafe {
            env::set_var(MAX_DEPTH_ENV, "5");
        }
        assert!(check().is_ok());

        // 0 disables the guard entirely.
        unsafe {
            env::set_var(DEPTH_ENV, "40");
            env::set_var(MAX_DEPTH_ENV, "0");
        }
        assert!(check().is_ok());

        unsafe {
            env::remove_var(DEPTH_ENV);
            env::remove_var(MAX_DEPTH_ENV);
        }
    }
}
