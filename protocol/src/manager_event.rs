//! Typed events a session's message manager emits back to the session that
//! owns it. Emission is synchronous; multiple subscribers are allowed.

use serde::Deserialize;
use serde::Serialize;

use crate::operation::ApprovalKind;

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ManagerEvent {
    /// Every question in a set has an answer.
    QuestionComplete {
        tool_use_id: String,
        answers: Vec<QuestionAnswer>,
    },

    /// A plan or action approval was resolved by an authorized reaction.
    ApprovalComplete {
        tool_use_id: String,
        kind: ApprovalKind,
        approved: bool,
        user_id: String,
    },

    /// The session owner ruled on a message from a non-allowed user.
    MessageApprovalComplete {
        decision: MessageApprovalDecision,
        from_user: String,
        message: String,
        files: Vec<String>,
    },

    /// A compact-context prompt was resolved.
    ContextPromptComplete { approved: bool },

    /// The worktree branch / failure-retry prompt was resolved.
    WorktreePromptComplete {
        decision: WorktreeDecision,
        queued: Option<QueuedPrompt>,
        failed_branch: Option<String>,
    },

    UpdatePromptComplete { decision: UpdateDecision },

    BugReportComplete { approved: bool },

    StatusUpdate {
        model: Option<String>,
        total_cost_usd: Option<f64>,
        tokens: Option<u64>,
    },

    Lifecycle { state: SessionLifecycle },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QuestionAnswer {
    pub header: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageApprovalDecision {
    /// Forward this one message to the agent.
    AllowOnce,
    /// Forward the message and add the author to the allowed-user set.
    Invite,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum WorktreeDecision {
    /// The user picked one of the suggested branch names.
    Branch { name: String },
    Skip,
}

/// Prompt text captured while a worktree prompt was pending, replayed once
/// the prompt resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueuedPrompt {
    pub text: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub response_post_id: Option<String>,
    /// True when this is the first prompt of the session, echoed into the
    /// session-start post.
    #[serde(default)]
    pub first_prompt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDecision {
    Now,
    Defer,
}

/// Session lifecycle states. `Idle` is a derived condition of `Active`
/// sessions (a function of last-activity age), not a stored state, but it is
/// part of the vocabulary because the supervisor reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLifecycle {
    #[default]
    Starting,
    Active,
    Idle,
    /// The child was killed on idle timeout; the session resumes on the next
    /// user message.
    Paused,
    /// Intentional subprocess replacement (`!cd`, worktree switch); exit
    /// cleanup is suppressed.
    Restarting,
    /// User-initiated stop; exit cleanup side effects are skipped.
    Cancelled,
}

impl SessionLifecycle {
    /// Whether exactly one agent child must be alive in this state.
    pub fn owns_child(self) -> bool {
        matches!(self, SessionLifecycle::Starting | SessionLifecycle::Active)
    }
}
