//! Post-exit error detection over the recorded message stream.
//!
//! A runner can exit 0 while its last tool invocations failed. The
//! heuristic: tool errors that happen *before* the agent's last text
//! response are treated as recovered (the agent saw them and kept
//! going); errors after it, or errors with no text response at all,
//! mean the run ended in a failure the agent never addressed.
//!
//! Deterministic and pure over the recorded messages.

use overseer_protocol::MessageRecord;
use regex_lite::Regex;
use std::sync::LazyLock;

/// Fatal line patterns per tool, matched against tool-result output even
/// when the result is not flagged `is_error`.
static BASH_FATAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?im)^.*permission denied.*$",
        r"(?im)^.*command not found.*$",
        r"(?im)\bexited with code 1\d\d\b",
        r"(?im)\bcode 1\d\d\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid fatal pattern {p}: {e}")))
    .collect()
});

/// Outcome of the heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorDetection {
    pub has_error: bool,
    /// Human-readable reason for the failure verdict.
    pub reason: Option<String>,
}

fn fatal_pattern_match(tool: &str, output: &str) -> Option<String> {
    let patterns: &[Regex] = match tool {
        "bash" | "shell" => &BASH_FATAL,
        _ => return None,
    };
    for re in patterns {
        if let Some(m) = re.find(output) {
            return Some(m.as_str().trim().to_string());
        }
    }
    None
}

/// Decide whether a zero-exit run actually failed.
pub fn detect_error(messages: &[MessageRecord]) -> ErrorDetection {
    let last_text_index = messages.iter().rposition(MessageRecord::is_text_response);

    // With no text response at all, any tool error is unrecovered.
    let scan_from = last_text_index.map_or(0, |i| i + 1);

    for record in &messages[scan_from..] {
        if let MessageRecord::ToolResult {
            tool,
            output,
            is_error,
        } = record
        {
            if *is_error {
                return ErrorDetection {
                    has_error: true,
                    reason: Some(format!("tool {tool} reported an error after the last response")),
                };
            }
            if let Some(line) = fatal_pattern_match(tool, output) {
                return ErrorDetection {
                    has_error: true,
                    reason: Some(format!("fatal {tool} output: {line}")),
                };
            }
        }
    }

    ErrorDetection::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_protocol::ToolCallRecord;
    use pretty_assertions::assert_eq;

    fn assistant(text: &str) -> MessageRecord {
        MessageRecord::Assistant {
            text: text.to_string(),
            tool_calls: vec![],
        }
    }

    fn tool_call_only() -> MessageRecord {
        MessageRecord::Assistant {
            text: String::new(),
            tool_calls: vec![ToolCallRecord {
                tool: "read".to_string(),
                call_id: None,
                arguments: serde_json::Value::Null,
            }],
        }
    }

    fn tool_result(tool: &str, output: &str, is_error: bool) -> MessageRecord {
        MessageRecord::ToolResult {
            tool: tool.to_string(),
            output: output.to_string(),
            is_error,
        }
    }

    #[test]
    fn error_before_last_text_is_recovered() {
        let messages = vec![
            tool_result("read", "ok", false),
            tool_result("read", "EISDIR", true),
            assistant("Complete review despite the directory hiccup."),
        ];
        assert_eq!(detect_error(&messages), ErrorDetection::default());
    }

    #[test]
    fn error_after_last_text_fails_the_run() {
        let messages = vec![
            assistant("Working on it."),
            tool_result("write", "disk full", true),
        ];
        let detection = detect_error(&messages);
        assert!(detection.has_error);
    }

    #[test]
    fn tool_errors_with_no_text_response_fail() {
        let messages = vec![tool_call_only(), tool_result("read", "EACCES", true)];
        assert!(detect_error(&messages).has_error);
    }

    #[test]
    fn bash_fatal_pattern_flags_unmarked_result() {
        let messages = vec![
            assistant("Running the build."),
            tool_result("bash", "sh: ./deploy.sh: Permission denied", false),
        ];
        let detection = detect_error(&messages);
        assert!(detection.has_error);
        assert!(detection.reason.unwrap().contains("bash"));
    }

    #[test]
    fn bash_exit_code_marker_flags_failure() {
        let messages = vec![
            assistant("Checking."),
            tool_result("bash", "command failed: code 127", false),
        ];
        assert!(detect_error(&messages).has_error);
    }

    #[test]
    fn clean_run_detects_nothing() {
        let messages = vec![
            tool_result("read", "contents", false),
            assistant("All done."),
        ];
        assert_eq!(detect_error(&messages), ErrorDetection::default());
    }

    #[test]
    fn fatal_patterns_only_apply_to_matching_tool() {
        // A grep result quoting "permission denied" is not a bash failure.
        let messages = vec![
            assistant("Searching."),
            tool_result("grep", "docs: 'permission denied' handling", false),
        ];
        assert!(!detect_error(&messages).has_error);
    }

    #[test]
    fn no_messages_means_no_error() {
        assert_eq!(detect_error(&[]), ErrorDetection::default());
    }
}
