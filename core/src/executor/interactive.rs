//! Approvals, question sets, and cross-user message approval.
//!
//! Each sub-state-machine waits on reactions. Unauthorized reactions are
//! ignored and the waiter keeps waiting; an authorized reaction resolves
//! the post, updates its body to record who decided, and emits exactly one
//! completion event.

use std::sync::Arc;

use coderelay_platform::reactions;
use coderelay_platform::ChatClient;
use coderelay_platform::PlatformError;
use coderelay_protocol::manager_event::ManagerEvent;
use coderelay_protocol::manager_event::MessageApprovalDecision;
use coderelay_protocol::manager_event::QuestionAnswer;
use coderelay_protocol::manager_event::UpdateDecision;
use coderelay_protocol::operation::ApprovalKind;
use coderelay_protocol::operation::QuestionItem;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::post_tracker::PostKind;
use crate::post_tracker::PostTracker;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PendingApproval {
    pub post_id: String,
    pub tool_use_id: String,
    pub kind: ApprovalKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PendingQuestionSet {
    pub tool_use_id: String,
    pub idx: usize,
    pub post_id: String,
    pub items: Vec<QuestionItem>,
}

#[derive(Debug, Clone)]
struct PendingMessageApproval {
    post_id: String,
    from_user_id: String,
    from_username: String,
    message: String,
    files: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingPrompt {
    post_id: String,
}

pub struct InteractiveExecutor {
    session_id: String,
    thread_id: String,
    client: Arc<dyn ChatClient>,
    tracker: Arc<Mutex<PostTracker>>,

    approval: Option<PendingApproval>,
    question: Option<PendingQuestionSet>,
    message_approval: Option<PendingMessageApproval>,
    update_prompt: Option<PendingPrompt>,
    bug_report: Option<PendingPrompt>,
}

impl InteractiveExecutor {
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
            approval: None,
            question: None,
            message_approval: None,
            update_prompt: None,
            bug_report: None,
        }
    }

    async fn register(&self, post_id: &str, kind: PostKind) {
        self.tracker
            .lock()
            .await
            .register(post_id, &self.session_id, kind);
    }

    async fn unregister(&self, post_id: &str) {
        self.tracker.lock().await.remove(post_id);
    }

    // -- plan / action approval --------------------------------------------

    pub async fn post_approval(&mut self, tool_use_id: &str, kind: ApprovalKind) -> Result<()> {
        if let Some(stale) = self.approval.take() {
            warn!("replacing unresolved approval on post {}", stale.post_id);
            self.unregister(&stale.post_id).await;
        }
        let f = self.client.formatter();
        let title = match kind {
            ApprovalKind::Plan => "Plan ready for review",
            ApprovalKind::Action => "Approval required",
        };
        let body = format!(
            "🔔 {}\nReact with 👍 to approve or 👎 to deny.",
            f.bold(title)
        );
        let post = self
            .client
            .create_interactive_post(
                &body,
                &[reactions::APPROVE, reactions::DENY],
                Some(&self.thread_id),
            )
            .await?;
        self.register(&post.id, PostKind::Approval).await;
        self.approval = Some(PendingApproval {
            post_id: post.id,
            tool_use_id: tool_use_id.to_string(),
            kind,
        });
        Ok(())
    }

    async fn resolve_post(&self, post_id: &str, body: &str) {
        match self.client.update_post(post_id, body).await {
            Ok(()) | Err(PlatformError::PostGone(_)) => {}
            Err(e) => warn!("failed to resolve interactive post {post_id}: {e}"),
        }
        self.unregister(post_id).await;
    }

    /// Reactions on an approval-kind post. Routes internally between plan /
    /// action approval and cross-user message approval by post id.
    pub async fn handle_approval_reaction(
        &mut self,
        post_id: &str,
        emoji: &str,
        user_id: &str,
        username: &str,
        authorized: bool,
        is_owner: bool,
    ) -> Result<Option<ManagerEvent>> {
        if self
            .message_approval
            .as_ref()
            .is_some_and(|m| m.post_id == post_id)
        {
            return self.handle_message_approval(emoji, username, is_owner).await;
        }

        if self.approval.as_ref().is_none_or(|a| a.post_id != post_id) {
            return Ok(None);
        }
        if !authorized {
            debug!("ignoring approval reaction from unauthorized user {user_id}");
            return Ok(None);
        }

        let approved = if reactions::is_approval(emoji) {
            true
        } else if reactions::is_denial(emoji) {
            false
        } else {
            return Ok(None);
        };

        let Some(pending) = self.approval.take() else {
            return Ok(None);
        };
        let f = self.client.formatter();
        let verdict = if approved { "Approved" } else { "Denied" };
        let body = format!("{} by {}", verdict, f.mention(username));
        self.resolve_post(&pending.post_id, &body).await;

        Ok(Some(ManagerEvent::ApprovalComplete {
            tool_use_id: pending.tool_use_id,
            kind: pending.kind,
            approved,
            user_id: user_id.to_string(),
        }))
    }

    // -- question sets -----------------------------------------------------

    fn render_question(
        f: &dyn coderelay_platform::Formatter,
        item: &QuestionItem,
        idx: usize,
        total: usize,
    ) -> String {
        let header = if item.header.is_empty() {
            "Question".to_string()
        } else {
            item.header.clone()
        };
        let mut body = format!(
            "❓ {} — {}\n\n{}\n",
            f.bold(&format!("Question {}/{}", idx + 1, total)),
            header,
            item.prompt
        );
        for (i, option) in item.options.iter().enumerate().take(9) {
            let label = f.bold(&option.label);
            match &option.description {
                Some(desc) => body.push_str(&format!("\n{} {label} — {desc}", glyph(i))),
                None => body.push_str(&format!("\n{} {label}", glyph(i))),
            }
        }
        if item.multi_select {
            body.push_str("\n\nPick any that apply, then react ✅ to continue.");
        }
        body
    }

    pub async fn post_question_set(
        &mut self,
        tool_use_id: &str,
        questions: Vec<QuestionItem>,
        current_index: usize,
    ) -> Result<()> {
        if questions.is_empty() {
            return Ok(());
        }
        if let Some(stale) = self.question.take() {
            warn!("replacing unresolved question set on post {}", stale.post_id);
            self.unregister(&stale.post_id).await;
        }

        let idx = current_index.min(questions.len() - 1);
        let body = Self::render_question(
            self.client.formatter(),
            &questions[idx],
            idx,
            questions.len(),
        );
        let mut seed: Vec<&str> = reactions::number_names(questions[idx].options.len()).to_vec();
        if questions[idx].multi_select {
            seed.push(reactions::ALLOW_ALL);
        }
        let post = self
            .client
            .create_interactive_post(&body, &seed, Some(&self.thread_id))
            .await?;
        self.register(&post.id, PostKind::Question).await;
        self.question = Some(PendingQuestionSet {
            tool_use_id: tool_use_id.to_string(),
            idx,
            post_id: post.id,
            items: questions,
        });
        Ok(())
    }

    pub async fn handle_question_reaction(
        &mut self,
        post_id: &str,
        emoji: &str,
        user_id: &str,
        authorized: bool,
    ) -> Result<Option<ManagerEvent>> {
        if self.question.as_ref().is_none_or(|q| q.post_id != post_id) {
            return Ok(None);
        }
        if !authorized {
            debug!("ignoring question reaction from unauthorized user {user_id}");
            return Ok(None);
        }

        // Mutate the current item, then release the borrow before any I/O.
        let next_render = {
            let Some(state) = self.question.as_mut() else {
                return Ok(None);
            };
            let idx = state.idx;
            let total = state.items.len();
            let item = &mut state.items[idx];
            let mut advance = false;
            if let Some(option_idx) = reactions::number_index(emoji) {
                let Some(option) = item.options.get(option_idx) else {
                    return Ok(None);
                };
                if item.multi_select {
                    // Accumulate labels; completion comes from the check mark.
                    match &mut item.answer {
                        Some(answer) if answer.split(", ").any(|a| a == option.label) => {}
                        Some(answer) => {
                            answer.push_str(", ");
                            answer.push_str(&option.label);
                        }
                        None => item.answer = Some(option.label.clone()),
                    }
                } else {
                    item.answer = Some(option.label.clone());
                    advance = true;
                }
            } else if item.multi_select && reactions::is_allow_all(emoji) && item.answer.is_some() {
                advance = true;
            } else {
                return Ok(None);
            }

            if !advance {
                return Ok(None);
            }
            state.idx += 1;
            state
                .items
                .get(state.idx)
                .map(|item| (item.clone(), state.idx, total))
        };

        if let Some((next, idx, total)) = next_render {
            // Render the next item in place and top up its controls.
            let body = Self::render_question(self.client.formatter(), &next, idx, total);
            self.client.update_post(post_id, &body).await?;
            for name in reactions::number_names(next.options.len()) {
                if let Err(e) = self.client.add_reaction(post_id, name).await {
                    debug!("failed to seed reaction {name}: {e}");
                }
            }
            if next.multi_select
                && let Err(e) = self.client.add_reaction(post_id, reactions::ALLOW_ALL).await
            {
                debug!("failed to seed reaction: {e}");
            }
            return Ok(None);
        }

        // Every item answered: one completion event for the whole set.
        let Some(state) = self.question.take() else {
            return Ok(None);
        };
        let answers: Vec<QuestionAnswer> = state
            .items
            .iter()
            .map(|item| QuestionAnswer {
                header: item.header.clone(),
                answer: item.answer.clone().unwrap_or_default(),
            })
            .collect();
        let f = self.client.formatter();
        let mut body = format!("✅ {}", f.bold("Questions answered"));
        for answer in &answers {
            body.push_str(&format!("\n{}: {}", answer.header, answer.answer));
        }
        self.resolve_post(&state.post_id, &body).await;

        Ok(Some(ManagerEvent::QuestionComplete {
            tool_use_id: state.tool_use_id,
            answers,
        }))
    }

    // -- cross-user message approval ---------------------------------------

    pub async fn post_message_approval(
        &mut self,
        owner_username: &str,
        from_user_id: &str,
        from_username: &str,
        message: &str,
        files: Vec<String>,
    ) -> Result<()> {
        if self.message_approval.is_some() {
            // One at a time; later messages wait for the next attempt.
            debug!("message approval already pending; dropping new request");
            return Ok(());
        }
        let f = self.client.formatter();
        let body = format!(
            "{} {} wants to send a message to this session:\n\n{}\n\n{} — react 👍 allow once · ✅ invite · 👎 deny",
            f.mention(owner_username),
            f.bold(from_username),
            f.blockquote(message),
            f.italic("Only the session owner can decide"),
        );
        let post = self
            .client
            .create_interactive_post(
                &body,
                &[reactions::APPROVE, reactions::ALLOW_ALL, reactions::DENY],
                Some(&self.thread_id),
            )
            .await?;
        self.register(&post.id, PostKind::Approval).await;
        self.message_approval = Some(PendingMessageApproval {
            post_id: post.id,
            from_user_id: from_user_id.to_string(),
            from_username: from_username.to_string(),
            message: message.to_string(),
            files,
        });
        Ok(())
    }

    async fn handle_message_approval(
        &mut self,
        emoji: &str,
        username: &str,
        is_owner: bool,
    ) -> Result<Option<ManagerEvent>> {
        if !is_owner {
            debug!("ignoring message-approval reaction from non-owner {username}");
            return Ok(None);
        }
        let decision = if reactions::is_approval(emoji) {
            MessageApprovalDecision::AllowOnce
        } else if reactions::is_allow_all(emoji) {
            MessageApprovalDecision::Invite
        } else if reactions::is_denial(emoji) {
            MessageApprovalDecision::Deny
        } else {
            return Ok(None);
        };

        let Some(pending) = self.message_approval.take() else {
            return Ok(None);
        };
        let f = self.client.formatter();
        let verdict = match decision {
            MessageApprovalDecision::AllowOnce => "Allowed once",
            MessageApprovalDecision::Invite => "Invited",
            MessageApprovalDecision::Deny => "Denied",
        };
        let body = format!("{verdict} by {}", f.mention(username));
        self.resolve_post(&pending.post_id, &body).await;

        Ok(Some(ManagerEvent::MessageApprovalComplete {
            decision,
            from_user: pending.from_user_id,
            message: pending.message,
            files: pending.files,
        }))
    }

    // -- update & bug-report prompts ---------------------------------------

    pub async fn post_update_prompt(&mut self, version: &str) -> Result<()> {
        let f = self.client.formatter();
        let body = format!(
            "⬆️ {} {version} is available.\nReact 👍 to update now or 👎 to defer.",
            f.bold("Update")
        );
        let post = self
            .client
            .create_interactive_post(
                &body,
                &[reactions::APPROVE, reactions::DENY],
                Some(&self.thread_id),
            )
            .await?;
        self.register(&post.id, PostKind::UpdatePrompt).await;
        self.update_prompt = Some(PendingPrompt { post_id: post.id });
        Ok(())
    }

    pub async fn handle_update_prompt_reaction(
        &mut self,
        post_id: &str,
        emoji: &str,
        username: &str,
        authorized: bool,
    ) -> Result<Option<ManagerEvent>> {
        if self
            .update_prompt
            .as_ref()
            .is_none_or(|p| p.post_id != post_id)
            || !authorized
        {
            return Ok(None);
        }
        let decision = if reactions::is_approval(emoji) {
            UpdateDecision::Now
        } else if reactions::is_denial(emoji) {
            UpdateDecision::Defer
        } else {
            return Ok(None);
        };
        self.update_prompt = None;
        let f = self.client.formatter();
        let verdict = match decision {
            UpdateDecision::Now => "Updating now",
            UpdateDecision::Defer => "Deferred",
        };
        self.resolve_post(post_id, &format!("{verdict} — {}", f.mention(username)))
            .await;
        Ok(Some(ManagerEvent::UpdatePromptComplete { decision }))
    }

    pub async fn post_bug_report_prompt(&mut self, summary: &str) -> Result<()> {
        let f = self.client.formatter();
        let body = format!(
            "🐛 {}\n\n{}\n\nReact 👍 to file it or 👎 to discard.",
            f.bold("File a bug report?"),
            f.blockquote(summary),
        );
        let post = self
            .client
            .create_interactive_post(
                &body,
                &[reactions::APPROVE, reactions::DENY],
                Some(&self.thread_id),
            )
            .await?;
        self.register(&post.id, PostKind::BugReport).await;
        self.bug_report = Some(PendingPrompt { post_id: post.id });
        Ok(())
    }

    pub async fn handle_bug_report_reaction(
        &mut self,
        post_id: &str,
        emoji: &str,
        username: &str,
        authorized: bool,
    ) -> Result<Option<ManagerEvent>> {
        if self
            .bug_report
            .as_ref()
            .is_none_or(|p| p.post_id != post_id)
            || !authorized
        {
            return Ok(None);
        }
        let approved = if reactions::is_approval(emoji) {
            true
        } else if reactions::is_denial(emoji) {
            false
        } else {
            return Ok(None);
        };
        self.bug_report = None;
        let f = self.client.formatter();
        let verdict = if approved { "Filed" } else { "Discarded" };
        self.resolve_post(post_id, &format!("{verdict} by {}", f.mention(username)))
            .await;
        Ok(Some(ManagerEvent::BugReportComplete { approved }))
    }

    // -- persistence -------------------------------------------------------

    pub fn pending_approval(&self) -> Option<&PendingApproval> {
        self.approval.as_ref()
    }

    pub fn pending_question_set(&self) -> Option<&PendingQuestionSet> {
        self.question.as_ref()
    }

    pub fn has_pending_prompt(&self) -> bool {
        self.approval.is_some() || self.question.is_some() || self.message_approval.is_some()
    }

    pub async fn hydrate(
        &mut self,
        approval: Option<PendingApproval>,
        question: Option<PendingQuestionSet>,
    ) {
        if let Some(approval) = approval {
            self.register(&approval.post_id, PostKind::Approval).await;
            self.approval = Some(approval);
        }
        if let Some(question) = question {
            self.register(&question.post_id, PostKind::Question).await;
            self.question = Some(question);
        }
    }
}

fn glyph(index: usize) -> &'static str {
    const GLYPHS: [&str; 9] = [
        "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣",
    ];
    GLYPHS.get(index).copied().unwrap_or("▫️")
}
