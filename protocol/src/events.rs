//! Wire events emitted by the runner executable.
//!
//! The runner writes one JSON object per line on stdout. Only four event
//! types carry information the engine acts on; unknown lines are skipped by
//! the streaming parser rather than failing the run.

use serde::Deserialize;
use serde::Serialize;

/// One line of the runner's stdout JSONL stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// An assistant message finished. Carries the message content parts and,
    /// when the runner reports it, token usage for the turn.
    MessageEnd {
        #[serde(default)]
        content: Vec<ContentPart>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },

    /// A tool invocation started executing.
    ToolExecutionStart {
        tool: String,
        #[serde(default)]
        call_id: Option<String>,
    },

    /// A tool invocation finished executing.
    ToolExecutionEnd {
        tool: String,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    /// The full result of a tool invocation is available.
    ToolResultEnd {
        tool: String,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A part of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        arguments: serde_json::Value,
    },
}

/// Token accounting reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Dollar cost when the runner reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl TokenUsage {
    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        if let Some(c) = other.cost {
            *self.cost.get_or_insert(0.0) += c;
        }
    }
}

/// A recorded tool call inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The ordered transcript of a single run, replayed from the event stream.
///
/// `Assistant` entries with an empty `text` and a non-empty `tool_calls`
/// list are tool-call-only messages; the error-detection heuristic treats
/// them as carrying no recovery evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum MessageRecord {
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRecord>,
    },
    ToolResult {
        tool: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl MessageRecord {
    /// Whether this is an assistant message containing non-whitespace text.
    pub fn is_text_response(&self) -> bool {
        match self {
            Self::Assistant { text, .. } => !text.trim().is_empty(),
            Self::ToolResult { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_end_round_trips() {
        let line = r#"{"type":"message_end","content":[{"kind":"text","text":"done"}],"usage":{"input_tokens":10,"output_tokens":5,"total_tokens":15}}"#;
        let event: RunnerEvent = serde_json::from_str(line).unwrap();
        match &event {
            RunnerEvent::MessageEnd { content, usage } => {
                assert_eq!(content.len(), 1);
                assert_eq!(usage.unwrap().total_tokens, 15);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_result_defaults_is_error() {
        let line = r#"{"type":"tool_result_end","tool":"bash","output":"ok"}"#;
        let event: RunnerEvent = serde_json::from_str(line).unwrap();
        match event {
            RunnerEvent::ToolResultEnd { is_error, .. } => assert!(!is_error),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn usage_accumulates_cost_from_none() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            cost: Some(0.25),
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 2,
            cost: None,
        });
        assert_eq!(total.total_tokens, 5);
        assert_eq!(total.cost, Some(0.25));
    }

    #[test]
    fn tool_call_only_message_is_not_a_text_response() {
        let record = MessageRecord::Assistant {
            text: "  \n".to_string(),
            tool_calls: vec![ToolCallRecord {
                tool: "read".to_string(),
                call_id: None,
                arguments: serde_json::Value::Null,
            }],
        };
        assert!(!record.is_text_response());
    }
}
