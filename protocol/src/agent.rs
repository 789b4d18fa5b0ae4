//! Wire protocol spoken by the agent subprocess.
//!
//! The agent writes line-delimited JSON objects to stdout, each with a
//! `type` discriminant. Unknown types must be tolerated so newer agent
//! builds can introduce event kinds without breaking the bridge.

use serde::Deserialize;
use serde::Serialize;

use crate::operation::TaskStatus;

/// Tool names the transform layer treats specially instead of routing
/// through the generic tool formatter.
pub const TOOL_TODO_WRITE: &str = "TodoWrite";
pub const TOOL_TASK: &str = "Task";
pub const TOOL_ASK_USER_QUESTION: &str = "AskUserQuestion";
pub const TOOL_EXIT_PLAN_MODE: &str = "ExitPlanMode";

/// One event read from the agent's stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum AgentEvent {
    /// A full assistant turn: ordered content blocks (text, tool use,
    /// thinking).
    Assistant { message: AssistantMessage },

    /// Standalone notification that a tool invocation started.
    ToolUse { tool_use: ToolUse },

    /// A tool invocation finished.
    ToolResult { tool_result: ToolResult },

    /// The turn is complete; carries usage accounting.
    Result { result: TurnResult },

    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Parse one stdout line. `Ok(None)` means the line was valid JSON of an
    /// event kind this build does not know about and should be skipped.
    pub fn parse_line(line: &str) -> serde_json::Result<Option<AgentEvent>> {
        let line = line.trim();
        match serde_json::from_str::<AgentEvent>(line)? {
            AgentEvent::Unknown => Ok(None),
            event => Ok(Some(event)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
    /// Server-side tool use (e.g. web search) — rendered but never paired
    /// with a local result.
    ServerToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TurnResult {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Typed arguments for the special tools. These are parsed out of the raw
// `input` value on demand; a parse failure downgrades the call to the generic
// tool formatter rather than dropping the event.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TodoWriteArgs {
    pub todos: Vec<TodoItemArg>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TodoItemArg {
    pub content: String,
    pub status: TaskStatus,
    #[serde(default, rename = "activeForm")]
    pub active_form: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub subagent_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskUserQuestionArgs {
    pub questions: Vec<QuestionArg>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuestionArg {
    #[serde(default)]
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOptionArg>,
    #[serde(default, rename = "multiSelect")]
    pub multi_select: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuestionOptionArg {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Input written to the agent's stdin, one JSON object per line.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInput {
    User { message: UserMessage },
}

#[derive(Debug, Clone, Serialize)]
pub struct UserMessage {
    pub role: &'static str,
    pub content: Vec<UserContent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text { text: String },
}

impl AgentInput {
    pub fn user_text(text: impl Into<String>) -> Self {
        AgentInput::User {
            message: UserMessage {
                role: "user",
                content: vec![UserContent::Text { text: text.into() }],
            },
        }
    }

    /// Serialize to the single stdin line the agent expects (no trailing
    /// newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_assistant_event_with_mixed_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"hello"},
            {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/tmp/a"}},
            {"type":"thinking","thinking":"hmm"}
        ]}}"#;
        let event = AgentEvent::parse_line(line).unwrap().unwrap();
        let AgentEvent::Assistant { message } = event else {
            panic!("expected assistant event");
        };
        assert_eq!(message.content.len(), 3);
        assert!(matches!(&message.content[0], ContentBlock::Text { text } if text == "hello"));
    }

    #[test]
    fn unknown_event_type_is_skipped() {
        let parsed = AgentEvent::parse_line(r#"{"type":"system","subtype":"init"}"#).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn unknown_content_block_is_tolerated() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"redacted_thinking","data":"x"}]}}"#;
        let event = AgentEvent::parse_line(line).unwrap().unwrap();
        let AgentEvent::Assistant { message } = event else {
            panic!("expected assistant event");
        };
        assert!(matches!(message.content[0], ContentBlock::Unknown));
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(AgentEvent::parse_line("not json").is_err());
    }

    #[test]
    fn todo_write_args_accept_camel_case_active_form() {
        let input = r#"{"todos":[{"content":"a","status":"in_progress","activeForm":"Doing a"}]}"#;
        let args: TodoWriteArgs = serde_json::from_str(input).unwrap();
        assert_eq!(args.todos[0].active_form.as_deref(), Some("Doing a"));
        assert_eq!(args.todos[0].status, TaskStatus::InProgress);
    }

    #[test]
    fn user_input_serializes_to_one_line() {
        let line = AgentInput::user_text("fix the bug").to_line().unwrap();
        assert_eq!(
            line,
            r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"fix the bug"}]}}"#
        );
    }
}
