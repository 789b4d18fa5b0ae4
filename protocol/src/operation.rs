//! Abstract message operations.
//!
//! The transform layer turns each agent event into an ordered list of these
//! operations; the executors turn operations into chat posts. Operations for
//! one session are totally ordered.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageOperation {
    /// Add text to the session's content buffer. `block` marks a semantic
    /// unit (a formatted tool line, a result marker) that must not be split
    /// internally.
    AppendContent {
        body: String,
        #[serde(default)]
        block: bool,
    },

    /// Request a flush of accumulated content. Idempotent on an empty
    /// buffer.
    Flush { reason: FlushReason },

    TaskList {
        action: TaskListAction,
        tasks: Vec<TaskItem>,
    },

    Question {
        tool_use_id: String,
        questions: Vec<QuestionItem>,
        current_index: usize,
    },

    Approval {
        tool_use_id: String,
        kind: ApprovalKind,
    },

    Subagent {
        tool_use_id: String,
        phase: SubagentPhase,
        description: String,
        kind: Option<String>,
    },

    StatusUpdate {
        model: Option<String>,
        total_cost_usd: Option<f64>,
        tokens: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Explicit,
    ToolComplete,
    Result,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskListAction {
    Update,
    /// Terminal: the task post becomes read-only and is never bumped again.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TaskItem {
    pub content: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub active_form: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QuestionItem {
    pub header: String,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
    /// Filled in as the user answers; the set completes when every item has
    /// one.
    #[serde(default)]
    pub answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Plan,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentPhase {
    Start,
    Stop,
}

/// Progress summary over a task list: `(completed, total)`.
pub fn task_progress(tasks: &[TaskItem]) -> (usize, usize) {
    let done = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    (done, tasks.len())
}

/// The task the session is currently working on, if any.
pub fn active_task(tasks: &[TaskItem]) -> Option<&TaskItem> {
    tasks.iter().find(|t| t.status == TaskStatus::InProgress)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    fn task(content: &str, status: TaskStatus) -> TaskItem {
        TaskItem {
            content: content.to_string(),
            status,
            active_form: None,
        }
    }

    #[test]
    fn progress_counts_completed_only() {
        let tasks = vec![
            task("a", TaskStatus::Completed),
            task("b", TaskStatus::InProgress),
            task("c", TaskStatus::Pending),
        ];
        assert_eq!(task_progress(&tasks), (1, 3));
        assert_eq!(active_task(&tasks).unwrap().content, "b");
    }

    #[test]
    fn operations_round_trip_through_serde() {
        let op = MessageOperation::Question {
            tool_use_id: "t1".to_string(),
            questions: vec![QuestionItem {
                header: "Scope".to_string(),
                prompt: "Which module?".to_string(),
                options: vec![QuestionOption {
                    label: "core".to_string(),
                    description: None,
                }],
                multi_select: false,
                answer: None,
            }],
            current_index: 0,
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: MessageOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
