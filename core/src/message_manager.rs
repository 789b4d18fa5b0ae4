//! Per-session aggregation point: one entry for agent events, one for
//! reactions, one for user messages. Dispatch is strictly sequential for a
//! session; executors only ever run under the session's work loop.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use coderelay_platform::ChatClient;
use coderelay_platform::ReactionAction;
use coderelay_platform::reactions;
use coderelay_protocol::agent::AgentEvent;
use coderelay_protocol::manager_event::ManagerEvent;
use coderelay_protocol::operation::FlushReason;
use coderelay_protocol::operation::MessageOperation;
use coderelay_protocol::operation::SubagentPhase;
use coderelay_protocol::operation::TaskListAction;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;

use crate::error::Result;
use crate::executor::content::ContentExecutor;
use crate::executor::content::FLUSH_DEBOUNCE;
use crate::executor::interactive::InteractiveExecutor;
use crate::executor::interactive::PendingApproval;
use crate::executor::interactive::PendingQuestionSet;
use crate::executor::task_list::TaskListExecutor;
use crate::executor::task_list::TaskListSnapshot;
use crate::executor::worktree_prompt::PendingWorktreePrompt;
use crate::executor::worktree_prompt::WorktreePromptExecutor;
use crate::post_tracker::PostKind;
use crate::post_tracker::PostTracker;
use crate::transform::TransformContext;
use crate::transform::transform;

pub struct MessageManager {
    session_id: String,
    thread_id: String,
    client: Arc<dyn ChatClient>,
    tracker: Arc<Mutex<PostTracker>>,
    transform_ctx: TransformContext,

    content: ContentExecutor,
    task_list: TaskListExecutor,
    interactive: InteractiveExecutor,
    worktree: WorktreePromptExecutor,

    owner_id: String,
    subscribers: Vec<mpsc::UnboundedSender<ManagerEvent>>,
}

impl MessageManager {
    /// Returns the manager and the flush-timer receiver the session's work
    /// loop must service.
    pub fn new(
        session_id: String,
        thread_id: String,
        client: Arc<dyn ChatClient>,
        tracker: Arc<Mutex<PostTracker>>,
        owner_id: String,
        worktree_root: Option<PathBuf>,
        detailed: bool,
    ) -> (Self, mpsc::UnboundedReceiver<FlushReason>) {
        let (content, flush_rx) = ContentExecutor::new(
            session_id.clone(),
            thread_id.clone(),
            client.clone(),
            tracker.clone(),
        );
        let task_list = TaskListExecutor::new(
            session_id.clone(),
            thread_id.clone(),
            client.clone(),
            tracker.clone(),
        );
        let interactive = InteractiveExecutor::new(
            session_id.clone(),
            thread_id.clone(),
            client.clone(),
            tracker.clone(),
        );
        let worktree = WorktreePromptExecutor::new(
            session_id.clone(),
            thread_id.clone(),
            client.clone(),
            tracker.clone(),
        );
        (
            Self {
                session_id,
                thread_id,
                client,
                tracker,
                transform_ctx: TransformContext::new(worktree_root, detailed),
                content,
                task_list,
                interactive,
                worktree,
                owner_id,
                subscribers: Vec::new(),
            },
            flush_rx,
        )
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: ManagerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn set_worktree_root(&mut self, root: Option<PathBuf>) {
        self.transform_ctx.worktree_root = root;
    }

    /// Sessions report their lifecycle transitions through the same typed
    /// channel the executors use, so subscribers see one ordered stream.
    pub fn emit_lifecycle(&mut self, state: coderelay_protocol::manager_event::SessionLifecycle) {
        self.emit(ManagerEvent::Lifecycle { state });
    }

    /// Transform one agent event and dispatch the resulting operations to
    /// the executors, in order.
    pub async fn handle_event(&mut self, event: &AgentEvent) -> Result<()> {
        let now = Utc::now();
        let ops = transform(
            event,
            &mut self.transform_ctx,
            self.client.formatter(),
            now,
        );
        for op in ops {
            self.dispatch(op).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, op: MessageOperation) -> Result<()> {
        match op {
            MessageOperation::AppendContent { body, block } => {
                self.content.append(&body, block);
                if self.content.should_flush_early() {
                    self.content.flush(&self.task_list).await?;
                } else {
                    self.content.schedule_flush(FLUSH_DEBOUNCE);
                }
            }

            MessageOperation::Flush { reason: _ } => {
                self.content.flush(&self.task_list).await?;
            }

            MessageOperation::TaskList { action, tasks } => match action {
                TaskListAction::Update => self.task_list.update(&tasks).await?,
                TaskListAction::Complete => self.task_list.complete(&tasks).await?,
            },

            MessageOperation::Question {
                tool_use_id,
                questions,
                current_index,
            } => {
                self.content.flush(&self.task_list).await?;
                self.interactive
                    .post_question_set(&tool_use_id, questions, current_index)
                    .await?;
            }

            MessageOperation::Approval { tool_use_id, kind } => {
                self.content.flush(&self.task_list).await?;
                self.interactive.post_approval(&tool_use_id, kind).await?;
            }

            MessageOperation::Subagent {
                phase,
                description,
                kind,
                ..
            } => {
                let f = self.client.formatter();
                let line = match phase {
                    SubagentPhase::Start => match kind {
                        Some(kind) => {
                            format!("🤖 {} ({kind}) — {description}", f.bold("Subagent"))
                        }
                        None => format!("🤖 {} — {description}", f.bold("Subagent")),
                    },
                    SubagentPhase::Stop => format!("  ↳ ✓ {description}"),
                };
                self.content.append(&line, true);
                self.content.schedule_flush(FLUSH_DEBOUNCE);
            }

            MessageOperation::StatusUpdate {
                model,
                total_cost_usd,
                tokens,
            } => {
                self.emit(ManagerEvent::StatusUpdate {
                    model,
                    total_cost_usd,
                    tokens,
                });
            }
        }
        Ok(())
    }

    async fn display_name(&self, user_id: &str) -> String {
        match self.client.username(user_id).await {
            Ok(name) => name,
            Err(e) => {
                debug!("failed to resolve username for {user_id}: {e}");
                user_id.to_string()
            }
        }
    }

    async fn is_authorized(&self, user_id: &str, username: &str) -> bool {
        user_id == self.owner_id || self.client.is_user_allowed(username)
    }

    /// Route a reaction to the executor that owns the post. Unknown posts
    /// are ignored.
    pub async fn handle_reaction(
        &mut self,
        post_id: &str,
        emoji: &str,
        action: ReactionAction,
        user_id: &str,
    ) -> Result<()> {
        let Some(entry) = self.tracker.lock().await.lookup(post_id).cloned() else {
            debug!("reaction on unknown post {post_id}; ignoring");
            return Ok(());
        };
        if entry.session_id != self.session_id {
            return Ok(());
        }

        // Minimize/expand follows both reaction directions; everything else
        // only reacts to additions.
        if entry.kind == PostKind::Task {
            if reactions::is_task_toggle(emoji) {
                self.task_list.toggle_minimize(action).await?;
            }
            return Ok(());
        }
        if action != ReactionAction::Added {
            return Ok(());
        }

        let username = self.display_name(user_id).await;
        let authorized = self.is_authorized(user_id, &username).await;
        let is_owner = user_id == self.owner_id;

        let event = match entry.kind {
            PostKind::Approval => {
                self.interactive
                    .handle_approval_reaction(post_id, emoji, user_id, &username, authorized, is_owner)
                    .await?
            }
            PostKind::Question => {
                self.interactive
                    .handle_question_reaction(post_id, emoji, user_id, authorized)
                    .await?
            }
            PostKind::WorktreePrompt => {
                self.worktree
                    .handle_reaction(post_id, emoji, user_id, &username, authorized)
                    .await?
            }
            PostKind::UpdatePrompt => {
                self.interactive
                    .handle_update_prompt_reaction(post_id, emoji, &username, authorized)
                    .await?
            }
            PostKind::BugReport => {
                self.interactive
                    .handle_bug_report_reaction(post_id, emoji, &username, authorized)
                    .await?
            }
            PostKind::Task | PostKind::Content | PostKind::System => None,
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// A user message arrived for this session: flush what the agent has
    /// produced so far, close the content chain so the agent's answer
    /// starts a fresh post, and keep the task list at the bottom.
    pub async fn handle_user_message(&mut self, text: &str, from_user: &str) -> Result<()> {
        info!(
            session = %self.session_id,
            from = %from_user,
            chars = text.len(),
            "user message"
        );
        self.prepare_for_user_message().await
    }

    pub async fn prepare_for_user_message(&mut self) -> Result<()> {
        self.content.flush(&self.task_list).await?;
        self.content.close_current_post();
        if self.task_list.has_active_tasks().await {
            self.task_list.on_bump_to_bottom().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.content.flush(&self.task_list).await
    }

    pub fn reset(&mut self) {
        self.content.reset();
    }

    pub async fn dispose(&mut self) {
        self.content.reset();
        self.tracker.lock().await.remove_by_session(&self.session_id);
    }

    pub fn has_pending_content(&self) -> bool {
        self.content.has_pending()
    }

    /// Post a bot status message into the thread (session start, command
    /// feedback, help).
    pub async fn post_system(&mut self, body: &str) -> Result<String> {
        let post = self
            .client
            .create_post(body, Some(&self.thread_id))
            .await?;
        self.tracker
            .lock()
            .await
            .register(&post.id, &self.session_id, PostKind::System);
        Ok(post.id)
    }

    // -- cross-user message approval ---------------------------------------

    pub async fn request_message_approval(
        &mut self,
        from_user_id: &str,
        message: &str,
        files: Vec<String>,
    ) -> Result<()> {
        let owner_id = self.owner_id.clone();
        let owner_username = self.display_name(&owner_id).await;
        let from_username = self.display_name(from_user_id).await;
        self.interactive
            .post_message_approval(&owner_username, from_user_id, &from_username, message, files)
            .await
    }

    // -- worktree prompts --------------------------------------------------

    pub fn worktree_prompts(&mut self) -> &mut WorktreePromptExecutor {
        &mut self.worktree
    }

    pub fn interactive(&mut self) -> &mut InteractiveExecutor {
        &mut self.interactive
    }

    // -- state for persistence and the overview ----------------------------

    pub async fn task_snapshot(&self) -> TaskListSnapshot {
        self.task_list.snapshot().await
    }

    pub fn pending_approval(&self) -> Option<PendingApproval> {
        self.interactive.pending_approval().cloned()
    }

    pub fn pending_question_set(&self) -> Option<PendingQuestionSet> {
        self.interactive.pending_question_set().cloned()
    }

    pub fn pending_worktree_prompt(&self) -> Option<PendingWorktreePrompt> {
        self.worktree.pending().cloned()
    }

    pub fn has_pending_prompt(&self) -> bool {
        self.interactive.has_pending_prompt() || self.worktree.pending().is_some()
    }

    pub async fn hydrate_task_list_state(
        &mut self,
        post_id: Option<String>,
        last_rendered_body: Option<String>,
        completed: bool,
        minimized: bool,
    ) {
        self.task_list
            .hydrate(post_id, last_rendered_body, completed, minimized)
            .await;
    }

    pub async fn hydrate_interactive_state(
        &mut self,
        approval: Option<PendingApproval>,
        question: Option<PendingQuestionSet>,
        worktree: Option<PendingWorktreePrompt>,
    ) {
        self.interactive.hydrate(approval, question).await;
        self.worktree.hydrate(worktree).await;
    }
}
