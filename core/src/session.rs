//! One session per chat thread.
//!
//! A session is a cooperatively single-threaded actor: its work loop
//! consumes agent events, routed chat activity, and timer ticks, and runs
//! everything — transform, executors, platform calls — serially. Different
//! sessions run in parallel. The session exclusively owns its agent child,
//! its message manager, and its timers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use coderelay_platform::ChatClient;
use coderelay_platform::ReactionAction;
use coderelay_protocol::manager_event::ManagerEvent;
use coderelay_protocol::manager_event::MessageApprovalDecision;
use coderelay_protocol::manager_event::QueuedPrompt;
use coderelay_protocol::manager_event::SessionLifecycle;
use coderelay_protocol::manager_event::UpdateDecision;
use coderelay_protocol::manager_event::WorktreeDecision;
use coderelay_protocol::agent::AgentEvent;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::agent_child::spawn_agent;
use crate::agent_child::AgentChildMsg;
use crate::agent_child::AgentHandle;
use crate::agent_child::AgentLaunch;
use crate::commands::Command;
use crate::commands::UpdateAction;
use crate::commands::WorktreeAction;
use crate::commands::parse_command;
use crate::config::Config;
use crate::config::PermissionMode;
use crate::error::Result;
use crate::message_manager::MessageManager;
use crate::persist::SessionRecord;
use crate::persist::SessionStore;
use crate::post_tracker::PostTracker;

const MAX_RESUME_FAILURES: u32 = 3;
const TYPING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);
const TOPIC_MAX_CHARS: usize = 60;

/// Interrupt control line understood by the agent CLI.
const AGENT_INTERRUPT_LINE: &str = r#"{"type":"control_request","request":{"subtype":"interrupt"}}"#;

#[derive(Debug)]
pub enum SessionWork {
    UserMessage {
        text: String,
        files: Vec<String>,
        user_id: String,
    },
    Reaction {
        post_id: String,
        emoji: String,
        action: ReactionAction,
        user_id: String,
    },
    Command {
        command: Command,
        rest: String,
        user_id: String,
    },
    IdleWarn,
    IdleTimeout,
    Shutdown {
        persist: bool,
    },
}

/// Read-only snapshot the supervisor uses for the sticky overview and idle
/// monitoring.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub owner: String,
    pub lifecycle: SessionLifecycle,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub topic: Option<String>,
    pub model: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub task_done: usize,
    pub task_total: usize,
    pub pending_prompt: bool,
    pub idle_warned: bool,
}

/// Messages a session sends up to its supervisor.
#[derive(Debug)]
pub enum SupervisorNotice {
    /// Remove the session from the registry; its loop has ended.
    SessionEnded { session_id: String },
    /// Something overview-visible changed; refresh the sticky post.
    Refresh,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub thread_id: String,
    tx: async_channel::Sender<SessionWork>,
    info: Arc<RwLock<SessionInfo>>,
}

impl SessionHandle {
    pub async fn send(&self, work: SessionWork) -> Result<()> {
        self.tx
            .send(work)
            .await
            .map_err(|_| crate::error::RelayErr::SessionLoopDied)
    }

    pub async fn info(&self) -> SessionInfo {
        self.info.read().await.clone()
    }
}

pub struct SessionParams {
    pub platform_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub owner: String,
    pub working_dir: PathBuf,
    pub config: Arc<Config>,
    pub client: Arc<dyn ChatClient>,
    pub tracker: Arc<tokio::sync::Mutex<PostTracker>>,
    pub store: SessionStore,
    pub supervisor_tx: mpsc::UnboundedSender<SupervisorNotice>,
}

pub fn session_id_for(platform_id: &str, thread_id: &str) -> String {
    format!("{platform_id}:{thread_id}")
}

struct SessionActor {
    config: Arc<Config>,
    client: Arc<dyn ChatClient>,
    store: SessionStore,
    supervisor_tx: mpsc::UnboundedSender<SupervisorNotice>,

    record: SessionRecord,
    allowed_users: HashSet<String>,
    permission_mode: PermissionMode,
    has_agent_responded: bool,
    /// True while the current child came from `--resume`.
    was_resumed: bool,
    idle_warned: bool,

    manager: MessageManager,
    manager_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    flush_rx: mpsc::UnboundedReceiver<coderelay_protocol::operation::FlushReason>,

    agent: Option<AgentHandle>,
    agent_tx: mpsc::UnboundedSender<AgentChildMsg>,
    agent_rx: mpsc::UnboundedReceiver<AgentChildMsg>,

    work_rx: async_channel::Receiver<SessionWork>,
    info: Arc<RwLock<SessionInfo>>,
    typing: Option<CancellationToken>,

    /// Prompt captured while the worktree prompt is unresolved.
    queued_prompt: Option<QueuedPrompt>,
}

/// Create a brand-new session for a thread: spawn the agent, post the
/// session-start notice, and (optionally) open the worktree branch prompt
/// before the first prompt reaches the agent.
pub async fn start_session(
    params: SessionParams,
    first_prompt: String,
    files: Vec<String>,
    worktree_suggestions: Option<Vec<String>>,
) -> Result<SessionHandle> {
    let session_id = session_id_for(&params.platform_id, &params.thread_id);
    let now = Utc::now();
    let record = SessionRecord {
        session_id: session_id.clone(),
        platform_id: params.platform_id.clone(),
        channel_id: params.channel_id.clone(),
        thread_id: params.thread_id.clone(),
        agent_session_id: Some(Uuid::new_v4()),
        working_dir: params.working_dir.clone(),
        owner: params.owner.clone(),
        allowed_users: Vec::new(),
        session_start_post_id: None,
        task_post_id: None,
        task_last_body: None,
        task_completed: false,
        task_minimized: false,
        pending_question: None,
        pending_approval: None,
        pending_worktree_prompt: None,
        lifecycle: SessionLifecycle::Starting,
        resume_fail_count: 0,
        message_count: 0,
        first_prompt: Some(first_prompt.clone()),
        worktree_branch: None,
        recent_events: Vec::new(),
        created_at: now,
        last_activity_at: now,
    };

    let (mut actor, handle) = SessionActor::build(params, record, false)?;
    actor.spawn_agent_child(false)?;
    actor.post_session_start().await;

    if let Some(suggestions) = worktree_suggestions.filter(|s| !s.is_empty()) {
        let queued = QueuedPrompt {
            text: first_prompt,
            files,
            response_post_id: None,
            first_prompt: true,
        };
        actor
            .manager
            .worktree_prompts()
            .post_branch_suggestions(suggestions, Some(queued))
            .await?;
    } else {
        actor.deliver_to_agent(&first_prompt, &files).await;
    }

    tokio::spawn(actor.run());
    Ok(handle)
}

/// Recreate a persisted session: restart the child with `--resume` and
/// rehydrate executor state. On permanent failure the record is deleted and
/// a final notice posted.
pub async fn resume_session(params: SessionParams, record: SessionRecord) -> Result<SessionHandle> {
    let session_id = record.session_id.clone();
    let (mut actor, handle) = SessionActor::build(params, record, true)?;

    actor
        .manager
        .hydrate_task_list_state(
            actor.record.task_post_id.clone(),
            actor.record.task_last_body.clone(),
            actor.record.task_completed,
            actor.record.task_minimized,
        )
        .await;
    actor
        .manager
        .hydrate_interactive_state(
            actor.record.pending_approval.clone(),
            actor.record.pending_question.clone(),
            actor.record.pending_worktree_prompt.clone(),
        )
        .await;

    if let Err(e) = actor.spawn_agent_child(true) {
        return actor.fail_resume(session_id, e).await;
    }
    actor.was_resumed = true;
    actor.has_agent_responded = true;
    actor.set_lifecycle(SessionLifecycle::Active).await;
    let _ = actor.manager.post_system("🔄 Session resumed.").await;
    actor.persist().await;

    tokio::spawn(actor.run());
    Ok(handle)
}

impl SessionActor {
    fn build(
        params: SessionParams,
        record: SessionRecord,
        resumed: bool,
    ) -> Result<(Self, SessionHandle)> {
        let session_id = record.session_id.clone();
        let (manager, flush_rx) = MessageManager::new(
            session_id.clone(),
            record.thread_id.clone(),
            params.client.clone(),
            params.tracker.clone(),
            record.owner.clone(),
            None,
            params.config.detailed,
        );
        let mut manager = manager;
        let manager_rx = manager.subscribe();

        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = async_channel::bounded(64);

        let info = Arc::new(RwLock::new(SessionInfo {
            session_id: session_id.clone(),
            channel_id: record.channel_id.clone(),
            thread_id: record.thread_id.clone(),
            owner: record.owner.clone(),
            lifecycle: record.lifecycle,
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
            topic: record
                .first_prompt
                .as_deref()
                .map(|p| crate::util::truncate_with_ellipsis(crate::util::first_line(p), TOPIC_MAX_CHARS)),
            model: None,
            total_cost_usd: None,
            task_done: 0,
            task_total: 0,
            pending_prompt: false,
            idle_warned: false,
        }));

        let allowed_users: HashSet<String> = record.allowed_users.iter().cloned().collect();
        let handle = SessionHandle {
            session_id,
            thread_id: record.thread_id.clone(),
            tx: work_tx,
            info: info.clone(),
        };

        Ok((
            Self {
                permission_mode: params.config.permission_mode,
                config: params.config,
                client: params.client,
                store: params.store,
                supervisor_tx: params.supervisor_tx,
                record,
                allowed_users,
                has_agent_responded: resumed,
                was_resumed: resumed,
                idle_warned: false,
                manager,
                manager_rx,
                flush_rx,
                agent: None,
                agent_tx,
                agent_rx,
                work_rx,
                info,
                typing: None,
                queued_prompt: None,
            },
            handle,
        ))
    }

    fn spawn_agent_child(&mut self, resume: bool) -> Result<()> {
        let agent_session_id = match self.record.agent_session_id {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                self.record.agent_session_id = Some(id);
                id
            }
        };
        // Fresh channel per spawn: a replaced child's late exit message
        // dies with the old receiver instead of being pinned on the new
        // child.
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        self.agent_tx = agent_tx;
        self.agent_rx = agent_rx;
        let handle = spawn_agent(
            AgentLaunch {
                command: &self.config.agent_cmd,
                cwd: &self.record.working_dir,
                agent_session_id,
                resume,
                permission_mode: self.permission_mode,
            },
            self.agent_tx.clone(),
        )?;
        info!(
            session = %self.record.session_id,
            pid = ?handle.pid,
            resume,
            "agent child spawned"
        );
        self.agent = Some(handle);
        Ok(())
    }

    async fn fail_resume(
        mut self,
        session_id: String,
        err: crate::error::RelayErr,
    ) -> Result<SessionHandle> {
        error!(session = %session_id, "resume failed: {err}");
        self.record.resume_fail_count += 1;
        if self.record.resume_fail_count >= MAX_RESUME_FAILURES {
            let _ = self
                .manager
                .post_system("❌ This session could not be resumed and has been closed.")
                .await;
            let _ = self.store.delete(&session_id).await;
            Err(crate::error::RelayErr::ResumeFailed(session_id))
        } else {
            self.persist().await;
            Err(err)
        }
    }

    async fn post_session_start(&mut self) {
        let f = self.client.formatter();
        let mode = match self.permission_mode {
            PermissionMode::Interactive => "interactive",
            PermissionMode::Auto => "auto",
        };
        let body = format!(
            "🚀 {}\n{}",
            f.bold("Session started"),
            f.key_value_list(&[
                ("Directory", self.record.working_dir.display().to_string()),
                ("Permissions", mode.to_string()),
            ]),
        );
        match self.manager.post_system(&body).await {
            Ok(post_id) => self.record.session_start_post_id = Some(post_id),
            Err(e) => warn!("failed to post session start notice: {e}"),
        }
    }

    async fn set_lifecycle(&mut self, state: SessionLifecycle) {
        if self.record.lifecycle == state {
            return;
        }
        debug!(
            session = %self.record.session_id,
            from = ?self.record.lifecycle,
            to = ?state,
            "lifecycle transition"
        );
        self.record.lifecycle = state;
        self.info.write().await.lifecycle = state;
        self.manager.emit_lifecycle(state);
        let _ = self.supervisor_tx.send(SupervisorNotice::Refresh);
    }

    async fn touch(&mut self) {
        let now = Utc::now();
        self.record.last_activity_at = now;
        let mut info = self.info.write().await;
        info.last_activity_at = now;
        info.idle_warned = false;
        self.idle_warned = false;
    }

    fn start_typing(&mut self) {
        if self.typing.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        let client = self.client.clone();
        let thread_id = self.record.thread_id.clone();
        let child = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(TYPING_INTERVAL) => {
                        if let Err(e) = client.send_typing(&thread_id).await {
                            debug!("typing heartbeat failed: {e}");
                        }
                    }
                }
            }
        });
        self.typing = Some(token);
    }

    fn stop_typing(&mut self) {
        if let Some(token) = self.typing.take() {
            token.cancel();
        }
    }

    async fn persist(&mut self) {
        // A session only becomes persistable once the agent has answered;
        // earlier records would resume into an empty conversation.
        if !self.has_agent_responded {
            return;
        }
        let task = self.manager.task_snapshot().await;
        self.record.task_post_id = task.post_id;
        self.record.task_last_body = task.last_rendered_body;
        self.record.task_completed = task.completed;
        self.record.task_minimized = task.minimized;
        self.record.pending_approval = self.manager.pending_approval();
        self.record.pending_question = self.manager.pending_question_set();
        self.record.pending_worktree_prompt = self.manager.pending_worktree_prompt();
        self.record.allowed_users = self.allowed_users.iter().cloned().collect();

        {
            let mut info = self.info.write().await;
            info.task_done = task.done;
            info.task_total = task.total;
            info.pending_prompt = self.manager.has_pending_prompt();
        }

        if let Err(e) = self.store.save(&self.record).await {
            error!("failed to persist session {}: {e}", self.record.session_id);
        }
    }

    async fn unpersist(&mut self) {
        if let Err(e) = self.store.delete(&self.record.session_id).await {
            warn!("failed to delete session record: {e}");
        }
    }

    async fn deliver_to_agent(&mut self, text: &str, files: &[String]) {
        let mut payload = text.to_string();
        if !files.is_empty() {
            payload.push_str("\n\nAttached files:\n");
            for file in files {
                payload.push_str(&format!("- {file}\n"));
            }
        }
        let Some(agent) = self.agent.as_mut() else {
            warn!("no agent child to deliver message to");
            return;
        };
        if let Err(e) = agent.send_user_text(&payload).await {
            error!("failed to write to agent stdin: {e}");
            return;
        }
        self.record.message_count += 1;
        self.start_typing();
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                work = self.work_rx.recv() => match work {
                    Ok(work) => {
                        let shutdown = matches!(work, SessionWork::Shutdown { .. });
                        if let Err(e) = self.handle_work(work).await {
                            error!(session = %self.record.session_id, "work failed: {e}");
                        }
                        if shutdown || self.record.lifecycle == SessionLifecycle::Cancelled {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                Some(msg) = self.agent_rx.recv() => {
                    let ended = self.handle_agent_msg(msg).await;
                    if ended {
                        break;
                    }
                }
                Some(_reason) = self.flush_rx.recv() => {
                    if let Err(e) = self.manager.flush().await {
                        warn!("timer flush failed: {e}");
                    }
                }
                Some(event) = self.manager_rx.recv() => {
                    if let Err(e) = self.handle_manager_event(event).await {
                        warn!("manager event handling failed: {e}");
                    }
                }
            }
        }

        self.stop_typing();
        self.manager.dispose().await;
        let _ = self.supervisor_tx.send(SupervisorNotice::SessionEnded {
            session_id: self.record.session_id.clone(),
        });
    }

    /// Returns `true` when the session should end.
    async fn handle_agent_msg(&mut self, msg: AgentChildMsg) -> bool {
        match msg {
            AgentChildMsg::Event(event) => {
                self.touch().await;
                self.record.push_recent_event(event_tag(&event));

                if !self.has_agent_responded
                    && matches!(*event, AgentEvent::Assistant { .. } | AgentEvent::Result { .. })
                {
                    self.has_agent_responded = true;
                    self.set_lifecycle(SessionLifecycle::Active).await;
                }

                if let Err(e) = self.manager.handle_event(&event).await {
                    warn!("event handling failed: {e}");
                }
                self.honor_agent_commands(&event).await;

                if matches!(*event, AgentEvent::Result { .. }) {
                    // Turn finished; quiesce the typing indicator and
                    // checkpoint state.
                    if !self.manager.has_pending_content() {
                        self.stop_typing();
                    }
                    self.persist().await;
                }
                false
            }
            AgentChildMsg::Exited { code } => self.handle_agent_exit(code).await,
        }
    }

    /// The agent may steer its own session with a small command subset
    /// (`!cd`, `!worktree list`) embedded in its text output. Everything
    /// else is user-only and must be ignored for safety.
    async fn honor_agent_commands(&mut self, event: &AgentEvent) {
        let AgentEvent::Assistant { message } = event else {
            return;
        };
        let mut commands = Vec::new();
        for block in &message.content {
            if let coderelay_protocol::agent::ContentBlock::Text { text } = block
                && let Some(Ok(parsed)) = parse_command(text)
            {
                if parsed.command.agent_allowed() {
                    commands.push(parsed.command);
                } else {
                    debug!("ignoring agent-emitted command {:?}", parsed.command);
                }
            }
        }
        let owner = self.record.owner.clone();
        for command in commands {
            if let Err(e) = self.handle_command(command, String::new(), owner.clone()).await {
                warn!("agent-emitted command failed: {e}");
            }
        }
    }

    async fn handle_agent_exit(&mut self, code: Option<i32>) -> bool {
        self.agent = None;
        self.stop_typing();
        match self.record.lifecycle {
            // Intentional replacement; the new child is (or will be)
            // spawned by the command that triggered the restart.
            SessionLifecycle::Restarting => false,
            SessionLifecycle::Cancelled => true,
            SessionLifecycle::Paused => false,
            _ => {
                if code == Some(0) {
                    let _ = self.manager.flush().await;
                    let _ = self.manager.post_system("✅ Session finished.").await;
                    if !self.was_resumed {
                        self.unpersist().await;
                    }
                    true
                } else if self.was_resumed {
                    self.record.resume_fail_count += 1;
                    if self.record.resume_fail_count >= MAX_RESUME_FAILURES {
                        let _ = self
                            .manager
                            .post_system("❌ The agent keeps failing to resume; closing this session.")
                            .await;
                        self.unpersist().await;
                        true
                    } else {
                        let _ = self
                            .manager
                            .post_system("⚠️ The agent exited; send a message to retry.")
                            .await;
                        self.set_lifecycle(SessionLifecycle::Paused).await;
                        self.persist().await;
                        false
                    }
                } else {
                    warn!(
                        session = %self.record.session_id,
                        code = ?code,
                        "agent exited unexpectedly"
                    );
                    let _ = self
                        .manager
                        .post_system("⚠️ The agent exited unexpectedly; send a message to restart it.")
                        .await;
                    let summary = format!(
                        "Agent exited with code {code:?}; recent events: {}",
                        self.record.recent_events.join(", ")
                    );
                    if let Err(e) = self
                        .manager
                        .interactive()
                        .post_bug_report_prompt(&summary)
                        .await
                    {
                        debug!("could not offer a bug report: {e}");
                    }
                    self.set_lifecycle(SessionLifecycle::Paused).await;
                    self.persist().await;
                    false
                }
            }
        }
    }

    async fn is_participant(&self, user_id: &str) -> bool {
        if user_id == self.record.owner {
            return true;
        }
        let username = match self.client.username(user_id).await {
            Ok(name) => name,
            Err(_) => return false,
        };
        self.allowed_users.contains(&username) || self.client.is_user_allowed(&username)
    }

    async fn handle_work(&mut self, work: SessionWork) -> Result<()> {
        match work {
            SessionWork::UserMessage {
                text,
                files,
                user_id,
            } => self.handle_user_message(text, files, user_id).await,
            SessionWork::Reaction {
                post_id,
                emoji,
                action,
                user_id,
            } => {
                self.manager
                    .handle_reaction(&post_id, &emoji, action, &user_id)
                    .await
            }
            SessionWork::Command {
                command,
                rest,
                user_id,
            } => self.handle_command(command, rest, user_id).await,
            SessionWork::IdleWarn => {
                if !self.idle_warned {
                    self.idle_warned = true;
                    self.info.write().await.idle_warned = true;
                    let _ = self
                        .manager
                        .post_system("💤 This session has been idle for a while and will be paused soon.")
                        .await;
                }
                Ok(())
            }
            SessionWork::IdleTimeout => {
                // Kill the child but keep the record so the session resumes
                // on the next message.
                if let Some(agent) = self.agent.as_mut() {
                    agent.kill();
                }
                self.set_lifecycle(SessionLifecycle::Paused).await;
                self.persist().await;
                Ok(())
            }
            SessionWork::Shutdown { persist } => {
                if persist {
                    self.persist().await;
                }
                if let Some(agent) = self.agent.as_mut() {
                    agent.kill();
                }
                Ok(())
            }
        }
    }

    async fn handle_user_message(
        &mut self,
        text: String,
        files: Vec<String>,
        user_id: String,
    ) -> Result<()> {
        self.touch().await;

        if !self.is_participant(&user_id).await {
            return self
                .manager
                .request_message_approval(&user_id, &text, files)
                .await;
        }

        // While a worktree prompt is open, hold the message instead of
        // racing the prompt.
        if self.manager.pending_worktree_prompt().is_some() {
            self.queued_prompt = Some(QueuedPrompt {
                text,
                files,
                response_post_id: None,
                first_prompt: false,
            });
            return Ok(());
        }

        if self.record.lifecycle == SessionLifecycle::Paused || self.agent.is_none() {
            let resume = self.record.agent_session_id.is_some() && self.has_agent_responded;
            self.spawn_agent_child(resume)?;
            self.was_resumed = resume;
            self.set_lifecycle(SessionLifecycle::Active).await;
        }

        self.manager.handle_user_message(&text, &user_id).await?;
        self.deliver_to_agent(&text, &files).await;
        self.persist().await;
        Ok(())
    }

    async fn handle_manager_event(&mut self, event: ManagerEvent) -> Result<()> {
        match event {
            ManagerEvent::QuestionComplete { answers, .. } => {
                let mut reply = String::new();
                for answer in &answers {
                    if answer.header.is_empty() {
                        reply.push_str(&format!("{}\n", answer.answer));
                    } else {
                        reply.push_str(&format!("{}: {}\n", answer.header, answer.answer));
                    }
                }
                self.manager.prepare_for_user_message().await?;
                self.deliver_to_agent(reply.trim_end(), &[]).await;
                self.persist().await;
            }

            ManagerEvent::ApprovalComplete { approved, .. } => {
                let reply = if approved {
                    "Approved. Go ahead."
                } else {
                    "Denied. Do not proceed; wait for further instructions."
                };
                self.manager.prepare_for_user_message().await?;
                self.deliver_to_agent(reply, &[]).await;
                self.persist().await;
            }

            ManagerEvent::MessageApprovalComplete {
                decision,
                from_user,
                message,
                files,
            } => {
                match decision {
                    MessageApprovalDecision::Deny => {
                        debug!("message from {from_user} denied by owner");
                    }
                    MessageApprovalDecision::AllowOnce | MessageApprovalDecision::Invite => {
                        if decision == MessageApprovalDecision::Invite
                            && let Ok(username) = self.client.username(&from_user).await
                        {
                            self.allowed_users.insert(username);
                        }
                        self.manager.prepare_for_user_message().await?;
                        self.deliver_to_agent(&message, &files).await;
                    }
                }
                self.persist().await;
            }

            ManagerEvent::ContextPromptComplete { approved } => {
                if approved
                    && let Some(agent) = self.agent.as_mut()
                {
                    let _ = agent.send_user_text("/compact").await;
                }
            }

            ManagerEvent::WorktreePromptComplete {
                decision, queued, ..
            } => {
                if let WorktreeDecision::Branch { name } = &decision {
                    self.record.worktree_branch = Some(name.clone());
                    self.manager
                        .set_worktree_root(Some(self.record.working_dir.clone()));
                    let f = self.client.formatter();
                    let _ = self
                        .manager
                        .post_system(&format!("🌿 Using worktree branch {}", f.inline_code(name)))
                        .await;
                }
                let queued = queued.or_else(|| self.queued_prompt.take());
                if let Some(queued) = queued {
                    self.manager.prepare_for_user_message().await?;
                    self.deliver_to_agent(&queued.text, &queued.files).await;
                }
                self.persist().await;
            }

            ManagerEvent::UpdatePromptComplete { decision } => {
                let note = match decision {
                    UpdateDecision::Now => "⬆️ Updating once every session is quiet.",
                    UpdateDecision::Defer => "⏸ Update deferred.",
                };
                let _ = self.manager.post_system(note).await;
            }

            ManagerEvent::BugReportComplete { approved } => {
                let note = if approved {
                    "🐛 Bug report filed. Thank you!"
                } else {
                    "🐛 Bug report discarded."
                };
                let _ = self.manager.post_system(note).await;
            }

            ManagerEvent::StatusUpdate {
                model,
                total_cost_usd,
                tokens: _,
            } => {
                let mut info = self.info.write().await;
                if model.is_some() {
                    info.model = model;
                }
                if total_cost_usd.is_some() {
                    info.total_cost_usd = total_cost_usd;
                }
                drop(info);
                let _ = self.supervisor_tx.send(SupervisorNotice::Refresh);
            }

            ManagerEvent::Lifecycle { .. } => {}
            _ => {}
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        command: Command,
        rest: String,
        user_id: String,
    ) -> Result<()> {
        self.touch().await;
        match command {
            Command::Stop => {
                self.set_lifecycle(SessionLifecycle::Cancelled).await;
                if let Some(agent) = self.agent.as_mut() {
                    agent.kill();
                }
                // Leave the task post legible but unpinned.
                let task = self.manager.task_snapshot().await;
                if let Some(post_id) = task.post_id
                    && !task.completed
                {
                    let _ = self.client.unpin_post(&post_id).await;
                }
                self.unpersist().await;
                let _ = self.manager.post_system("🛑 Session stopped.").await;
            }

            Command::Kill => {
                self.set_lifecycle(SessionLifecycle::Cancelled).await;
                if let Some(agent) = self.agent.as_mut() {
                    agent.kill();
                }
                self.unpersist().await;
                let _ = self.manager.post_system("💀 Session killed.").await;
            }

            Command::Escape => {
                if let Some(agent) = self.agent.as_mut() {
                    let _ = agent.send_raw_line(AGENT_INTERRUPT_LINE).await;
                }
                self.manager.reset();
            }

            Command::Approve => {
                self.manager.prepare_for_user_message().await?;
                self.deliver_to_agent("Yes, approved. Go ahead.", &[]).await;
            }

            Command::Help => {
                let body = help_text(self.client.formatter());
                let _ = self.manager.post_system(&body).await;
            }

            Command::Cd { path } => {
                let expanded = expand_path(&path);
                if !expanded.is_dir() {
                    let _ = self
                        .manager
                        .post_system(&format!("❌ Not a directory: {}", expanded.display()))
                        .await;
                    return Ok(());
                }
                self.set_lifecycle(SessionLifecycle::Restarting).await;
                if let Some(agent) = self.agent.as_mut() {
                    agent.kill();
                }
                self.record.working_dir = expanded.clone();
                self.record.agent_session_id = Some(Uuid::new_v4());
                self.spawn_agent_child(false)?;
                self.set_lifecycle(SessionLifecycle::Active).await;
                let _ = self
                    .manager
                    .post_system(&format!("📁 Working directory is now {}", expanded.display()))
                    .await;
                self.persist().await;
                if !rest.trim().is_empty() {
                    self.manager.handle_user_message(&rest, &user_id).await?;
                    self.deliver_to_agent(rest.trim(), &[]).await;
                }
            }

            Command::Invite { user } => {
                self.allowed_users.insert(user.clone());
                let f = self.client.formatter();
                let _ = self
                    .manager
                    .post_system(&format!("✅ {} can now use this session.", f.mention(&user)))
                    .await;
                self.persist().await;
            }

            Command::Kick { user } => {
                self.allowed_users.remove(&user);
                let f = self.client.formatter();
                let _ = self
                    .manager
                    .post_system(&format!("🚫 {} was removed from this session.", f.mention(&user)))
                    .await;
                self.persist().await;
            }

            Command::Permissions { mode } => {
                self.permission_mode = mode;
                let label = match mode {
                    PermissionMode::Interactive => "interactive",
                    PermissionMode::Auto => "auto",
                };
                let _ = self
                    .manager
                    .post_system(&format!(
                        "🔐 Permission mode set to {label}; applies when the agent restarts."
                    ))
                    .await;
            }

            Command::Update { action } => match action {
                Some(UpdateAction::Now) => {
                    let _ = self
                        .manager
                        .post_system("⬆️ Updating once every session is quiet.")
                        .await;
                }
                Some(UpdateAction::Defer) => {
                    let _ = self.manager.post_system("⏸ Update deferred.").await;
                }
                None => {
                    self.manager
                        .interactive()
                        .post_update_prompt("a new version")
                        .await?;
                }
            },

            Command::Worktree { action } => match action {
                WorktreeAction::List => {
                    let f = self.client.formatter();
                    let current = self
                        .record
                        .worktree_branch
                        .as_deref()
                        .unwrap_or("(none)");
                    let body = format!(
                        "🌿 {}\n{}",
                        f.bold("Worktree"),
                        f.key_value_list(&[
                            ("Branch", current.to_string()),
                            ("Directory", self.record.working_dir.display().to_string()),
                        ]),
                    );
                    let _ = self.manager.post_system(&body).await;
                }
                WorktreeAction::Switch(branch) | WorktreeAction::Create(branch) => {
                    self.set_lifecycle(SessionLifecycle::Restarting).await;
                    if let Some(agent) = self.agent.as_mut() {
                        agent.kill();
                    }
                    self.record.worktree_branch = Some(branch.clone());
                    self.record.agent_session_id = Some(Uuid::new_v4());
                    self.spawn_agent_child(false)?;
                    self.set_lifecycle(SessionLifecycle::Active).await;
                    let f = self.client.formatter();
                    let _ = self
                        .manager
                        .post_system(&format!(
                            "🌿 Switched to worktree branch {}",
                            f.inline_code(&branch)
                        ))
                        .await;
                    self.persist().await;
                }
            },

            Command::Passthrough { name } => {
                if let Some(agent) = self.agent.as_mut() {
                    let _ = agent.send_user_text(&format!("/{name}")).await;
                }
            }
        }
        Ok(())
    }
}

fn event_tag(event: &AgentEvent) -> &'static str {
    match event {
        AgentEvent::Assistant { .. } => "assistant",
        AgentEvent::ToolUse { .. } => "tool_use",
        AgentEvent::ToolResult { .. } => "tool_result",
        AgentEvent::Result { .. } => "result",
        _ => "unknown",
    }
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    PathBuf::from(path)
}

fn help_text(f: &dyn coderelay_platform::Formatter) -> String {
    format!(
        "ℹ️ {}\n{}",
        f.bold("Commands"),
        f.key_value_list(&[
            ("!stop / !cancel", "stop this session".to_string()),
            ("!escape / !interrupt", "interrupt the agent".to_string()),
            ("!approve / !yes", "approve the pending request".to_string()),
            ("!cd <path>", "restart the agent in another directory".to_string()),
            ("!invite @user / !kick @user", "manage session access".to_string()),
            (
                "!permissions interactive|auto",
                "set the agent permission mode".to_string()
            ),
            ("!worktree <name>|list|switch <branch>", "manage the worktree".to_string()),
            ("!update [now|defer]", "handle pending bot updates".to_string()),
            ("!context / !cost / !compact", "forwarded to the agent".to_string()),
            ("!kill", "force-kill this session".to_string()),
        ]),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn session_id_is_platform_scoped() {
        assert_eq!(session_id_for("mattermost", "t1"), "mattermost:t1");
    }

    #[test]
    fn expand_path_handles_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~/proj"), home.join("proj"));
        assert_eq!(expand_path("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn lifecycle_child_ownership_matches_states() {
        assert!(SessionLifecycle::Starting.owns_child());
        assert!(SessionLifecycle::Active.owns_child());
        assert!(!SessionLifecycle::Paused.owns_child());
        assert!(!SessionLifecycle::Cancelled.owns_child());
        assert!(!SessionLifecycle::Restarting.owns_child());
    }
}
