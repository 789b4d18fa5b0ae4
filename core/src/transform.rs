//! Event → operation transform.
//!
//! Pure apart from the per-tool start-time map used for elapsed-time
//! computation: the same event sequence produces the same operation
//! sequence. All I/O lives in the executors.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use coderelay_platform::Formatter;
use coderelay_protocol::agent::AgentEvent;
use coderelay_protocol::agent::AskUserQuestionArgs;
use coderelay_protocol::agent::ContentBlock;
use coderelay_protocol::agent::TaskArgs;
use coderelay_protocol::agent::TodoWriteArgs;
use coderelay_protocol::agent::TOOL_ASK_USER_QUESTION;
use coderelay_protocol::agent::TOOL_EXIT_PLAN_MODE;
use coderelay_protocol::agent::TOOL_TASK;
use coderelay_protocol::agent::TOOL_TODO_WRITE;
use coderelay_protocol::operation::ApprovalKind;
use coderelay_protocol::operation::FlushReason;
use coderelay_protocol::operation::MessageOperation;
use coderelay_protocol::operation::QuestionItem;
use coderelay_protocol::operation::QuestionOption;
use coderelay_protocol::operation::SubagentPhase;
use coderelay_protocol::operation::TaskItem;
use coderelay_protocol::operation::TaskListAction;
use coderelay_protocol::operation::TaskStatus;

use crate::tool_format::format_tool_use;
use crate::tool_format::ToolFormatContext;
use crate::util::elapsed_suffix;
use crate::util::strip_thinking_tags;
use crate::util::truncate_with_ellipsis;

const MAX_THINKING_CHARS: usize = 280;
const MAX_SUBAGENT_DESC_CHARS: usize = 120;

/// Per-session state the transform carries between events.
#[derive(Debug, Default)]
pub struct TransformContext {
    pub worktree_root: Option<PathBuf>,
    pub detailed: bool,
    /// `tool_use` id → start time, consumed by the matching `tool_result`.
    tool_start_times: HashMap<String, DateTime<Utc>>,
    /// `tool_use` ids that were subagent launches; their results render as
    /// subagent stops instead of result markers.
    subagent_descriptions: HashMap<String, String>,
}

impl TransformContext {
    pub fn new(worktree_root: Option<PathBuf>, detailed: bool) -> Self {
        Self {
            worktree_root,
            detailed,
            ..Default::default()
        }
    }
}

/// Transform one agent event into ordered message operations. `now` is the
/// only clock input, passed in so callers (and tests) control it.
pub fn transform(
    event: &AgentEvent,
    ctx: &mut TransformContext,
    formatter: &dyn Formatter,
    now: DateTime<Utc>,
) -> Vec<MessageOperation> {
    match event {
        AgentEvent::Assistant { message } => {
            let mut parts: Vec<String> = Vec::new();
            let mut tail: Vec<MessageOperation> = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => {
                        let stripped = strip_thinking_tags(text);
                        let trimmed = stripped.trim();
                        if !trimmed.is_empty() {
                            parts.push(trimmed.to_string());
                        }
                    }
                    ContentBlock::Thinking { thinking } => {
                        let trimmed = thinking.trim();
                        if !trimmed.is_empty() {
                            let short = truncate_with_ellipsis(trimmed, MAX_THINKING_CHARS);
                            parts.push(formatter.blockquote(&formatter.italic(&short)));
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        ctx.tool_start_times.insert(id.clone(), now);
                        match special_tool_ops(id, name, input, ctx) {
                            Some(ops) => tail.extend(ops),
                            None => parts.push(format_line(name, input, ctx, formatter)),
                        }
                    }
                    ContentBlock::ServerToolUse { name, input } => {
                        parts.push(format_line(name, input, ctx, formatter));
                    }
                    ContentBlock::Unknown => {}
                    _ => {}
                }
            }

            let mut ops = Vec::new();
            if !parts.is_empty() {
                ops.push(MessageOperation::AppendContent {
                    body: parts.join("\n\n"),
                    block: false,
                });
            }
            ops.extend(tail);
            ops
        }

        AgentEvent::ToolUse { tool_use } => {
            ctx.tool_start_times.insert(tool_use.id.clone(), now);
            match special_tool_ops(&tool_use.id, &tool_use.name, &tool_use.input, ctx) {
                Some(ops) => ops,
                None => vec![MessageOperation::AppendContent {
                    body: format_line(&tool_use.name, &tool_use.input, ctx, formatter),
                    block: true,
                }],
            }
        }

        AgentEvent::ToolResult { tool_result } => {
            let elapsed = ctx
                .tool_start_times
                .remove(&tool_result.tool_use_id)
                .and_then(|start| elapsed_suffix(start, now))
                .unwrap_or_default();

            if let Some(description) = ctx.subagent_descriptions.remove(&tool_result.tool_use_id) {
                return vec![
                    MessageOperation::Subagent {
                        tool_use_id: tool_result.tool_use_id.clone(),
                        phase: SubagentPhase::Stop,
                        description,
                        kind: None,
                    },
                    MessageOperation::Flush {
                        reason: FlushReason::ToolComplete,
                    },
                ];
            }

            let marker = if tool_result.is_error.unwrap_or(false) {
                format!("  ↳ ❌ err{elapsed}")
            } else {
                format!("  ↳ ✓{elapsed}")
            };
            vec![
                MessageOperation::AppendContent {
                    body: marker,
                    block: true,
                },
                MessageOperation::Flush {
                    reason: FlushReason::ToolComplete,
                },
            ]
        }

        AgentEvent::Result { result } => vec![
            MessageOperation::Flush {
                reason: FlushReason::Result,
            },
            MessageOperation::StatusUpdate {
                model: result.model.clone(),
                total_cost_usd: result.cost_usd,
                tokens: result.usage.as_ref().map(|u| u.total()),
            },
        ],

        _ => Vec::new(),
    }
}

fn format_line(
    name: &str,
    input: &serde_json::Value,
    ctx: &TransformContext,
    formatter: &dyn Formatter,
) -> String {
    format_tool_use(
        name,
        input,
        &ToolFormatContext {
            formatter,
            worktree_root: ctx.worktree_root.as_deref(),
            detailed: ctx.detailed,
        },
    )
}

/// Operations for the tools the pipeline understands natively. `None` means
/// "not special (or unparseable): use the generic formatter".
fn special_tool_ops(
    id: &str,
    name: &str,
    input: &serde_json::Value,
    ctx: &mut TransformContext,
) -> Option<Vec<MessageOperation>> {
    match name {
        TOOL_TODO_WRITE => {
            let args: TodoWriteArgs = serde_json::from_value(input.clone()).ok()?;
            let tasks: Vec<TaskItem> = args
                .todos
                .into_iter()
                .map(|t| TaskItem {
                    content: t.content,
                    status: t.status,
                    active_form: t.active_form,
                })
                .collect();
            let action = if !tasks.is_empty()
                && tasks.iter().all(|t| t.status == TaskStatus::Completed)
            {
                TaskListAction::Complete
            } else {
                TaskListAction::Update
            };
            Some(vec![MessageOperation::TaskList { action, tasks }])
        }

        TOOL_TASK => {
            let args: TaskArgs = serde_json::from_value(input.clone()).ok()?;
            let description = args
                .description
                .or(args.prompt)
                .map(|d| truncate_with_ellipsis(d.trim(), MAX_SUBAGENT_DESC_CHARS))
                .unwrap_or_else(|| "subagent".to_string());
            ctx.subagent_descriptions
                .insert(id.to_string(), description.clone());
            Some(vec![MessageOperation::Subagent {
                tool_use_id: id.to_string(),
                phase: SubagentPhase::Start,
                description,
                kind: args.subagent_type,
            }])
        }

        TOOL_ASK_USER_QUESTION => {
            let args: AskUserQuestionArgs = serde_json::from_value(input.clone()).ok()?;
            if args.questions.is_empty() {
                return Some(Vec::new());
            }
            let questions = args
                .questions
                .into_iter()
                .map(|q| QuestionItem {
                    header: q.header,
                    prompt: q.question,
                    options: q
                        .options
                        .into_iter()
                        .map(|o| QuestionOption {
                            label: o.label,
                            description: o.description,
                        })
                        .collect(),
                    multi_select: q.multi_select,
                    answer: None,
                })
                .collect();
            Some(vec![MessageOperation::Question {
                tool_use_id: id.to_string(),
                questions,
                current_index: 0,
            }])
        }

        TOOL_EXIT_PLAN_MODE => {
            let mut ops = Vec::new();
            if let Some(plan) = input.get("plan").and_then(|p| p.as_str())
                && !plan.trim().is_empty()
            {
                ops.push(MessageOperation::AppendContent {
                    body: plan.trim().to_string(),
                    block: true,
                });
            }
            ops.push(MessageOperation::Approval {
                tool_use_id: id.to_string(),
                kind: ApprovalKind::Plan,
            });
            Some(ops)
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use coderelay_platform::MarkdownFormatter;
    use coderelay_protocol::agent::AssistantMessage;
    use coderelay_protocol::agent::ToolResult;
    use coderelay_protocol::agent::ToolUse;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn assistant_text(text: &str) -> AgentEvent {
        AgentEvent::Assistant {
            message: AssistantMessage {
                content: vec![ContentBlock::Text {
                    text: text.to_string(),
                }],
            },
        }
    }

    #[test]
    fn text_blocks_join_into_one_append() {
        let event = AgentEvent::Assistant {
            message: AssistantMessage {
                content: vec![
                    ContentBlock::Text {
                        text: "first".to_string(),
                    },
                    ContentBlock::Text {
                        text: " second ".to_string(),
                    },
                ],
            },
        };
        let mut ctx = TransformContext::default();
        let ops = transform(&event, &mut ctx, &MarkdownFormatter, Utc::now());
        assert_eq!(
            ops,
            vec![MessageOperation::AppendContent {
                body: "first\n\nsecond".to_string(),
                block: false,
            }]
        );
    }

    #[test]
    fn embedded_thinking_tags_are_stripped() {
        let mut ctx = TransformContext::default();
        let ops = transform(
            &assistant_text("keep <thinking>drop</thinking> this"),
            &mut ctx,
            &MarkdownFormatter,
            Utc::now(),
        );
        let MessageOperation::AppendContent { body, .. } = &ops[0] else {
            panic!("expected append");
        };
        assert!(!body.contains("drop"));
        assert!(body.contains("keep"));
    }

    #[test]
    fn standalone_tool_use_is_a_block_append() {
        let event = AgentEvent::ToolUse {
            tool_use: ToolUse {
                id: "t1".to_string(),
                name: "Bash".to_string(),
                input: json!({"command": "ls"}),
            },
        };
        let mut ctx = TransformContext::default();
        let ops = transform(&event, &mut ctx, &MarkdownFormatter, Utc::now());
        assert_eq!(
            ops,
            vec![MessageOperation::AppendContent {
                body: "🔧 **Bash** `ls`".to_string(),
                block: true,
            }]
        );
    }

    #[test]
    fn tool_result_emits_marker_with_elapsed_then_flush() {
        let start = Utc::now();
        let mut ctx = TransformContext::default();
        let use_event = AgentEvent::ToolUse {
            tool_use: ToolUse {
                id: "t1".to_string(),
                name: "Read".to_string(),
                input: json!({"file_path": "/x"}),
            },
        };
        transform(&use_event, &mut ctx, &MarkdownFormatter, start);

        let result_event = AgentEvent::ToolResult {
            tool_result: ToolResult {
                tool_use_id: "t1".to_string(),
                is_error: None,
            },
        };
        let ops = transform(
            &result_event,
            &mut ctx,
            &MarkdownFormatter,
            start + TimeDelta::seconds(4),
        );
        assert_eq!(
            ops,
            vec![
                MessageOperation::AppendContent {
                    body: "  ↳ ✓ (4s)".to_string(),
                    block: true,
                },
                MessageOperation::Flush {
                    reason: FlushReason::ToolComplete,
                },
            ]
        );
    }

    #[test]
    fn sub_three_second_results_drop_the_elapsed_suffix() {
        let start = Utc::now();
        let mut ctx = TransformContext::default();
        transform(
            &AgentEvent::ToolUse {
                tool_use: ToolUse {
                    id: "t1".to_string(),
                    name: "Read".to_string(),
                    input: json!({}),
                },
            },
            &mut ctx,
            &MarkdownFormatter,
            start,
        );
        let ops = transform(
            &AgentEvent::ToolResult {
                tool_result: ToolResult {
                    tool_use_id: "t1".to_string(),
                    is_error: Some(true),
                },
            },
            &mut ctx,
            &MarkdownFormatter,
            start + TimeDelta::seconds(1),
        );
        let MessageOperation::AppendContent { body, .. } = &ops[0] else {
            panic!("expected append");
        };
        assert_eq!(body, "  ↳ ❌ err");
    }

    #[test]
    fn todo_write_becomes_task_list_update() {
        let event = AgentEvent::ToolUse {
            tool_use: ToolUse {
                id: "t1".to_string(),
                name: TOOL_TODO_WRITE.to_string(),
                input: json!({"todos": [
                    {"content": "a", "status": "completed"},
                    {"content": "b", "status": "in_progress", "activeForm": "Doing b"},
                ]}),
            },
        };
        let mut ctx = TransformContext::default();
        let ops = transform(&event, &mut ctx, &MarkdownFormatter, Utc::now());
        let MessageOperation::TaskList { action, tasks } = &ops[0] else {
            panic!("expected task list op");
        };
        assert_eq!(*action, TaskListAction::Update);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn all_completed_todos_become_complete_action() {
        let event = AgentEvent::ToolUse {
            tool_use: ToolUse {
                id: "t1".to_string(),
                name: TOOL_TODO_WRITE.to_string(),
                input: json!({"todos": [{"content": "a", "status": "completed"}]}),
            },
        };
        let mut ctx = TransformContext::default();
        let ops = transform(&event, &mut ctx, &MarkdownFormatter, Utc::now());
        assert!(matches!(
            &ops[0],
            MessageOperation::TaskList {
                action: TaskListAction::Complete,
                ..
            }
        ));
    }

    #[test]
    fn subagent_result_renders_stop_not_marker() {
        let now = Utc::now();
        let mut ctx = TransformContext::default();
        transform(
            &AgentEvent::ToolUse {
                tool_use: ToolUse {
                    id: "t1".to_string(),
                    name: TOOL_TASK.to_string(),
                    input: json!({"description": "explore the repo", "subagent_type": "general"}),
                },
            },
            &mut ctx,
            &MarkdownFormatter,
            now,
        );
        let ops = transform(
            &AgentEvent::ToolResult {
                tool_result: ToolResult {
                    tool_use_id: "t1".to_string(),
                    is_error: None,
                },
            },
            &mut ctx,
            &MarkdownFormatter,
            now,
        );
        assert!(matches!(
            &ops[0],
            MessageOperation::Subagent {
                phase: SubagentPhase::Stop,
                ..
            }
        ));
    }

    #[test]
    fn exit_plan_mode_appends_plan_then_requests_approval() {
        let event = AgentEvent::ToolUse {
            tool_use: ToolUse {
                id: "t9".to_string(),
                name: TOOL_EXIT_PLAN_MODE.to_string(),
                input: json!({"plan": "1. do things"}),
            },
        };
        let mut ctx = TransformContext::default();
        let ops = transform(&event, &mut ctx, &MarkdownFormatter, Utc::now());
        assert_eq!(ops.len(), 2);
        assert!(matches!(
            &ops[1],
            MessageOperation::Approval {
                kind: ApprovalKind::Plan,
                ..
            }
        ));
    }

    #[test]
    fn result_event_flushes_then_reports_status() {
        let mut ctx = TransformContext::default();
        let parsed = AgentEvent::parse_line(r#"{"type":"result","result":{"model":"m1","cost_usd":0.5}}"#)
            .unwrap()
            .unwrap();
        let ops = transform(&parsed, &mut ctx, &MarkdownFormatter, Utc::now());
        assert_eq!(
            ops,
            vec![
                MessageOperation::Flush {
                    reason: FlushReason::Result,
                },
                MessageOperation::StatusUpdate {
                    model: Some("m1".to_string()),
                    total_cost_usd: Some(0.5),
                    tokens: None,
                },
            ]
        );
    }
}
