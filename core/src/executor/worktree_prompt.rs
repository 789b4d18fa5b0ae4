//! Pending worktree prompts: branch suggestions for a fresh session and the
//! retry prompt after a failed worktree setup. While one is open, the
//! user's prompt text is queued and replayed once the prompt resolves.

use std::sync::Arc;

use coderelay_platform::reactions;
use coderelay_platform::ChatClient;
use coderelay_protocol::manager_event::ManagerEvent;
use coderelay_protocol::manager_event::QueuedPrompt;
use coderelay_protocol::manager_event::WorktreeDecision;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::post_tracker::PostKind;
use crate::post_tracker::PostTracker;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorktreePromptKind {
    BranchSuggestions { suggestions: Vec<String> },
    FailureRetry { failed_branch: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PendingWorktreePrompt {
    pub post_id: String,
    pub prompt: WorktreePromptKind,
    pub queued: Option<QueuedPrompt>,
}

pub struct WorktreePromptExecutor {
    session_id: String,
    thread_id: String,
    client: Arc<dyn ChatClient>,
    tracker: Arc<Mutex<PostTracker>>,
    pending: Option<PendingWorktreePrompt>,
}

impl WorktreePromptExecutor {
    pub fn new(
        session_id: String,
        thread_id: String,
        client: Arc<dyn ChatClient>,
        tracker: Arc<Mutex<PostTracker>>,
    ) -> Self {
        Self {
            session_id,
            thread_id,
            client,
            tracker,
            pending: None,
        }
    }

    pub async fn post_branch_suggestions(
        &mut self,
        suggestions: Vec<String>,
        queued: Option<QueuedPrompt>,
    ) -> Result<()> {
        if suggestions.is_empty() {
            return Ok(());
        }
        if let Some(stale) = self.pending.take() {
            warn!("replacing unresolved worktree prompt {}", stale.post_id);
            self.tracker.lock().await.remove(&stale.post_id);
        }
        let f = self.client.formatter();
        let mut body = format!(
            "🌿 {}\nPick a branch for this session's worktree, or 👎 to work in place.\n",
            f.bold("Worktree")
        );
        for (i, name) in suggestions.iter().enumerate().take(9) {
            body.push_str(&format!("\n{} {}", number_glyph(i), f.inline_code(name)));
        }
        let mut seed: Vec<&str> = reactions::number_names(suggestions.len()).to_vec();
        seed.push(reactions::DENY);
        let post = self
            .client
            .create_interactive_post(&body, &seed, Some(&self.thread_id))
            .await?;
        self.tracker
            .lock()
            .await
            .register(&post.id, &self.session_id, PostKind::WorktreePrompt);
        self.pending = Some(PendingWorktreePrompt {
            post_id: post.id,
            prompt: WorktreePromptKind::BranchSuggestions { suggestions },
            queued,
        });
        Ok(())
    }

    pub async fn post_failure_retry(
        &mut self,
        failed_branch: String,
        queued: Option<QueuedPrompt>,
    ) -> Result<()> {
        if let Some(stale) = self.pending.take() {
            warn!("replacing unresolved worktree prompt {}", stale.post_id);
            self.tracker.lock().await.remove(&stale.post_id);
        }
        let f = self.client.formatter();
        let body = format!(
            "⚠️ {} for {} failed.\nReact 👍 to retry or 👎 to continue without a worktree.",
            f.bold("Worktree setup"),
            f.inline_code(&failed_branch),
        );
        let post = self
            .client
            .create_interactive_post(
                &body,
                &[reactions::APPROVE, reactions::DENY],
                Some(&self.thread_id),
            )
            .await?;
        self.tracker
            .lock()
            .await
            .register(&post.id, &self.session_id, PostKind::WorktreePrompt);
        self.pending = Some(PendingWorktreePrompt {
            post_id: post.id,
            prompt: WorktreePromptKind::FailureRetry { failed_branch },
            queued,
        });
        Ok(())
    }

    pub async fn handle_reaction(
        &mut self,
        post_id: &str,
        emoji: &str,
        user_id: &str,
        username: &str,
        authorized: bool,
    ) -> Result<Option<ManagerEvent>> {
        if self.pending.as_ref().is_none_or(|p| p.post_id != post_id) {
            return Ok(None);
        }
        if !authorized {
            debug!("ignoring worktree reaction from unauthorized user {user_id}");
            return Ok(None);
        }

        let decision = {
            let Some(pending) = self.pending.as_ref() else {
                return Ok(None);
            };
            match &pending.prompt {
                WorktreePromptKind::BranchSuggestions { suggestions } => {
                    if let Some(idx) = reactions::number_index(emoji) {
                        match suggestions.get(idx) {
                            Some(name) => WorktreeDecision::Branch { name: name.clone() },
                            None => return Ok(None),
                        }
                    } else if reactions::is_denial(emoji) {
                        WorktreeDecision::Skip
                    } else {
                        return Ok(None);
                    }
                }
                WorktreePromptKind::FailureRetry { failed_branch } => {
                    if reactions::is_approval(emoji) {
                        WorktreeDecision::Branch {
                            name: failed_branch.clone(),
                        }
                    } else if reactions::is_denial(emoji) {
                        WorktreeDecision::Skip
                    } else {
                        return Ok(None);
                    }
                }
            }
        };

        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };
        self.tracker.lock().await.remove(&pending.post_id);
        let f = self.client.formatter();
        let body = match &decision {
            WorktreeDecision::Branch { name } => format!(
                "🌿 {} picked by {}",
                f.inline_code(name),
                f.mention(username)
            ),
            WorktreeDecision::Skip => format!("Skipped by {}", f.mention(username)),
        };
        if let Err(e) = self.client.update_post(&pending.post_id, &body).await {
            debug!("failed to resolve worktree prompt post: {e}");
        }

        let failed_branch = match pending.prompt {
            WorktreePromptKind::FailureRetry { failed_branch } => Some(failed_branch),
            WorktreePromptKind::BranchSuggestions { .. } => None,
        };
        Ok(Some(ManagerEvent::WorktreePromptComplete {
            decision,
            queued: pending.queued,
            failed_branch,
        }))
    }

    pub fn pending(&self) -> Option<&PendingWorktreePrompt> {
        self.pending.as_ref()
    }

    pub async fn hydrate(&mut self, pending: Option<PendingWorktreePrompt>) {
        if let Some(pending) = pending {
            self.tracker
                .lock()
                .await
                .register(&pending.post_id, &self.session_id, PostKind::WorktreePrompt);
            self.pending = Some(pending);
        }
    }
}

fn number_glyph(index: usize) -> &'static str {
    const GLYPHS: [&str; 9] = [
        "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣",
    ];
    GLYPHS.get(index).copied().unwrap_or("▫️")
}
