//! Terminal result file written once a background run finishes.
//!
//! The file lands atomically at `<resultsRoot>/<id>.json` after the
//! terminal `status.json` write. The in-process registry watches the
//! results directory, dispatches a completion event, then deletes the file.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Per-step slice of a terminal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStepResult {
    pub agent: String,
    pub output: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

/// The terminal result document (`<resultsRoot>/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub id: String,
    /// Agent name for a single run, `"a → b → c"` style label for a chain.
    pub agent: String,
    pub success: bool,
    pub summary: String,
    pub results: Vec<JobStepResult>,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<String>,
    pub cwd: String,
    pub async_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn result_round_trips_and_omits_absent_fields() {
        let result = JobResult {
            id: "abc123".to_string(),
            agent: "scout".to_string(),
            success: true,
            summary: "ok".to_string(),
            results: vec![JobStepResult {
                agent: "scout".to_string(),
                output: "world".to_string(),
                success: true,
                skipped: None,
                artifact_paths: None,
                truncated: None,
            }],
            exit_code: 0,
            timestamp: Utc::now(),
            duration_ms: 1500,
            truncated: false,
            artifacts_dir: None,
            cwd: "/work".to_string(),
            async_dir: "/tmp/async/abc123".to_string(),
            session_id: Some("sess-1".to_string()),
            session_file: None,
            share_url: None,
            share_error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"durationMs\":1500"));
        assert!(!json.contains("shareUrl"));
        let back: JobResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
