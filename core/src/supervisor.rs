//! Fleet-level supervision: admission control, chat-event routing, resume
//! at boot, idle monitoring, graceful shutdown, and the pinned channel
//! overview. The supervisor holds the session registry and may look up but
//! never mutates per-session state except through a session's work queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use coderelay_platform::ChatClient;
use coderelay_platform::ChatEvent;
use coderelay_protocol::manager_event::SessionLifecycle;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::commands::parse_command;
use crate::config::Config;
use crate::error::RelayErr;
use crate::error::Result;
use crate::overview::OverviewContext;
use crate::overview::render_overview;
use crate::persist::SessionStore;
use crate::post_tracker::PostTracker;
use crate::session::SessionHandle;
use crate::session::SessionInfo;
use crate::session::SessionParams;
use crate::session::SessionWork;
use crate::session::SupervisorNotice;
use crate::session::resume_session;
use crate::session::session_id_for;
use crate::session::start_session;

const MONITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const STICKY_THROTTLE: std::time::Duration = std::time::Duration::from_secs(1);

struct StickyState {
    post_id: Option<String>,
    last_body: String,
    last_update: Instant,
}

pub struct SessionSupervisor {
    config: Arc<Config>,
    client: Arc<dyn ChatClient>,
    store: SessionStore,
    tracker: Arc<Mutex<PostTracker>>,
    platform_id: String,
    version: String,
    started_at: DateTime<Utc>,

    sessions: RwLock<HashMap<String, SessionHandle>>,
    is_shutting_down: AtomicBool,
    sticky: Mutex<StickyState>,

    notice_tx: mpsc::UnboundedSender<SupervisorNotice>,
}

impl SessionSupervisor {
    /// Returns the supervisor and the notice receiver `run` consumes.
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn ChatClient>,
        platform_id: String,
        version: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let store = SessionStore::new(&config.data_dir);
        (
            Arc::new(Self {
                config,
                client,
                store,
                tracker: Arc::new(Mutex::new(PostTracker::new())),
                platform_id,
                version,
                started_at: Utc::now(),
                sessions: RwLock::new(HashMap::new()),
                is_shutting_down: AtomicBool::new(false),
                sticky: Mutex::new(StickyState {
                    post_id: None,
                    last_body: String::new(),
                    last_update: Instant::now()
                        .checked_sub(STICKY_THROTTLE)
                        .unwrap_or_else(Instant::now),
                }),
                notice_tx,
            }),
            notice_rx,
        )
    }

    fn session_params(&self, channel_id: &str, thread_id: &str, owner: &str) -> SessionParams {
        SessionParams {
            platform_id: self.platform_id.clone(),
            channel_id: channel_id.to_string(),
            thread_id: thread_id.to_string(),
            owner: owner.to_string(),
            working_dir: self.config.working_dir.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            tracker: self.tracker.clone(),
            store: self.store.clone(),
            supervisor_tx: self.notice_tx.clone(),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Restart every persisted session that still has a working directory.
    /// Broken records are cleaned up as they are found.
    pub async fn resume_all(&self) {
        let records = match self.store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                error!("failed to enumerate persisted sessions: {e}");
                return;
            }
        };
        for record in records {
            if record.platform_id != self.platform_id {
                continue;
            }
            if self.sessions.read().await.len() >= self.config.max_sessions {
                warn!("session limit reached during resume; leaving the rest persisted");
                break;
            }
            if !record.working_dir.is_dir() {
                warn!(
                    "dropping session {}: working directory {} is gone",
                    record.session_id,
                    record.working_dir.display()
                );
                let _ = self.store.delete(&record.session_id).await;
                continue;
            }
            let params =
                self.session_params(&record.channel_id, &record.thread_id, &record.owner);
            let session_id = record.session_id.clone();
            match resume_session(params, record).await {
                Ok(handle) => {
                    info!("resumed session {session_id}");
                    self.sessions.write().await.insert(session_id, handle);
                }
                Err(e) => warn!("could not resume session {session_id}: {e}"),
            }
        }
        self.refresh_sticky(true).await;
    }

    /// Main loop: chat events in, supervisor notices in, periodic monitor.
    pub async fn run(
        self: Arc<Self>,
        mut chat_rx: mpsc::Receiver<ChatEvent>,
        mut notice_rx: mpsc::UnboundedReceiver<SupervisorNotice>,
        shutdown: CancellationToken,
    ) {
        let mut monitor = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = chat_rx.recv() => {
                    if let Err(e) = self.handle_chat_event(event).await {
                        // One session's failure must never take the fleet
                        // down.
                        error!("chat event handling failed: {e}");
                    }
                }
                Some(notice) = notice_rx.recv() => match notice {
                    SupervisorNotice::SessionEnded { session_id } => {
                        self.remove_session(&session_id).await;
                    }
                    SupervisorNotice::Refresh => self.refresh_sticky(false).await,
                },
                _ = monitor.tick() => self.monitor().await,
            }
        }
        self.shutdown().await;
    }

    async fn remove_session(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            info!("session {session_id} removed");
        }
        self.tracker.lock().await.remove_by_session(session_id);
        self.refresh_sticky(true).await;
    }

    async fn handle_chat_event(&self, event: ChatEvent) -> Result<()> {
        match event {
            ChatEvent::MessageCreated {
                post_id,
                channel_id,
                thread_id,
                user_id,
                body,
                files,
            } => {
                if user_id == self.client.bot_user_id() {
                    return Ok(());
                }
                self.route_message(&post_id, &channel_id, &thread_id, &user_id, body, files)
                    .await
            }
            ChatEvent::MessageUpdated { post_id, .. } => {
                debug!("ignoring edit of post {post_id}");
                Ok(())
            }
            ChatEvent::Reaction {
                action,
                post_id,
                user_id,
                emoji,
                ..
            } => {
                if user_id == self.client.bot_user_id() {
                    return Ok(());
                }
                let session_id = {
                    let tracker = self.tracker.lock().await;
                    tracker.lookup(&post_id).map(|e| e.session_id.clone())
                };
                let Some(session_id) = session_id else {
                    debug!("reaction on unrouted post {post_id}");
                    return Ok(());
                };
                let handle = self.sessions.read().await.get(&session_id).cloned();
                if let Some(handle) = handle {
                    handle
                        .send(SessionWork::Reaction {
                            post_id,
                            emoji,
                            action,
                            user_id,
                        })
                        .await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn route_message(
        &self,
        post_id: &str,
        channel_id: &str,
        thread_id: &str,
        user_id: &str,
        body: String,
        files: Vec<String>,
    ) -> Result<()> {
        let session_id = session_id_for(&self.platform_id, thread_id);
        let handle = self.sessions.read().await.get(&session_id).cloned();

        if let Some(handle) = handle {
            match parse_command(&body) {
                Some(Ok(parsed)) => {
                    handle
                        .send(SessionWork::Command {
                            command: parsed.command,
                            rest: parsed.rest,
                            user_id: user_id.to_string(),
                        })
                        .await?;
                }
                Some(Err(err)) => {
                    // A known command with bad arguments gets feedback; the
                    // message never reaches the agent.
                    let _ = self
                        .client
                        .create_post(&format!("❌ {err}"), Some(thread_id))
                        .await;
                }
                None => {
                    handle
                        .send(SessionWork::UserMessage {
                            text: body,
                            files,
                            user_id: user_id.to_string(),
                        })
                        .await?;
                }
            }
            return Ok(());
        }

        // No session yet: only a fresh thread root that addresses the bot
        // starts one.
        if thread_id != post_id || !self.mentions_bot(&body).await {
            return Ok(());
        }
        self.start_new_session(channel_id, thread_id, user_id, body, files)
            .await
    }

    async fn mentions_bot(&self, body: &str) -> bool {
        let bot_id = self.client.bot_user_id().to_string();
        match self.client.username(&bot_id).await {
            Ok(name) => body.contains(&format!("@{name}")) || body.contains(&format!("<@{bot_id}>")),
            Err(_) => false,
        }
    }

    async fn strip_bot_mention(&self, body: &str) -> String {
        let bot_id = self.client.bot_user_id().to_string();
        let mut text = body.to_string();
        if let Ok(name) = self.client.username(&bot_id).await {
            text = text.replace(&format!("@{name}"), "");
        }
        text = text.replace(&format!("<@{bot_id}>"), "");
        text.trim().to_string()
    }

    async fn start_new_session(
        &self,
        channel_id: &str,
        thread_id: &str,
        user_id: &str,
        body: String,
        files: Vec<String>,
    ) -> Result<()> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            let _ = self
                .client
                .create_post("⛔ The bot is shutting down; try again shortly.", Some(thread_id))
                .await;
            return Err(RelayErr::ShuttingDown);
        }
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.config.max_sessions {
                let _ = self
                    .client
                    .create_post(
                        &format!(
                            "⛔ Session limit reached ({}); stop one with !stop first.",
                            self.config.max_sessions
                        ),
                        Some(thread_id),
                    )
                    .await;
                return Err(RelayErr::SessionLimit(self.config.max_sessions));
            }
        }

        let username = self
            .client
            .username(user_id)
            .await
            .unwrap_or_else(|_| user_id.to_string());
        if !self.client.is_user_allowed(&username) {
            debug!("ignoring session request from disallowed user {username}");
            return Ok(());
        }

        let prompt = self.strip_bot_mention(&body).await;
        let suggestions = self
            .config
            .worktrees
            .then(|| branch_suggestions(&prompt))
            .filter(|s| !s.is_empty());

        let params = self.session_params(channel_id, thread_id, user_id);
        let session_id = session_id_for(&self.platform_id, thread_id);
        info!("starting session {session_id} for {username}");
        let handle = start_session(params, prompt, files, suggestions).await?;
        self.sessions.write().await.insert(session_id, handle);
        self.refresh_sticky(true).await;
        Ok(())
    }

    async fn session_infos(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.info().await);
        }
        infos
    }

    /// Idle checks plus a sticky refresh, on the monitor cadence.
    async fn monitor(&self) {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let now = Utc::now();
        for handle in handles {
            let info = handle.info().await;
            if !matches!(
                info.lifecycle,
                SessionLifecycle::Active | SessionLifecycle::Starting
            ) {
                continue;
            }
            let idle = now.signed_duration_since(info.last_activity_at);
            let idle = std::time::Duration::from_secs(idle.num_seconds().max(0) as u64);
            if idle >= self.config.idle_timeout {
                info!("pausing idle session {}", info.session_id);
                let _ = handle.send(SessionWork::IdleTimeout).await;
            } else if idle >= self.config.idle_warn && !info.idle_warned {
                let _ = handle.send(SessionWork::IdleWarn).await;
            }
        }
        self.refresh_sticky(false).await;
    }

    /// Recompute the overview and post it if it changed. `force` bypasses
    /// the one-per-second throttle (but still skips no-op bodies).
    async fn refresh_sticky(&self, force: bool) {
        let mut sticky = self.sticky.lock().await;
        if !force && sticky.last_update.elapsed() < STICKY_THROTTLE {
            return;
        }
        let infos = self.session_infos().await;
        let body = render_overview(
            self.client.formatter(),
            &OverviewContext {
                version: &self.version,
                started_at: self.started_at,
                max_sessions: self.config.max_sessions,
            },
            &infos,
            Utc::now(),
        );
        if body == sticky.last_body {
            return;
        }

        if let Some(post_id) = sticky.post_id.clone()
            && let Err(e) = self.client.update_post(&post_id, &body).await
        {
            warn!("failed to update overview post: {e}");
            sticky.post_id = None;
        }
        if sticky.post_id.is_none() {
            match self.client.create_post(&body, None).await {
                Ok(post) => {
                    if let Err(e) = self.client.pin_post(&post.id).await {
                        debug!("failed to pin overview post: {e}");
                    }
                    sticky.post_id = Some(post.id);
                }
                Err(e) => {
                    warn!("failed to create overview post: {e}");
                    return;
                }
            }
        }
        sticky.last_body = body;
        sticky.last_update = Instant::now();
    }

    /// Persist everything, then kill all children in parallel. New sessions
    /// are rejected from the moment this starts.
    pub async fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        info!("shutting down {} sessions", handles.len());
        let shutdowns = handles
            .into_iter()
            .map(|handle| async move {
                let _ = handle.send(SessionWork::Shutdown { persist: true }).await;
            });
        futures::future::join_all(shutdowns).await;
    }
}

/// Branch-name suggestions for a worktree prompt, derived from the first
/// prompt's leading words.
fn branch_suggestions(prompt: &str) -> Vec<String> {
    let slug: String = prompt
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c == '-' || c == ' ' || c == '_' {
                Some('-')
            } else {
                None
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        return Vec::new();
    }
    vec![format!("relay/{slug}"), format!("relay/{slug}-alt")]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn branch_suggestions_slugify_the_prompt() {
        assert_eq!(
            branch_suggestions("Fix the flaky parser tests please"),
            vec![
                "relay/fix-the-flaky-parser".to_string(),
                "relay/fix-the-flaky-parser-alt".to_string()
            ]
        );
        assert!(branch_suggestions("!!!").is_empty());
    }
}
