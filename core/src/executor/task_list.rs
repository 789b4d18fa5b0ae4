//! Owner of the pinned task post.
//!
//! All task-post mutations (update, complete, minimize, both bump shapes,
//! and the plan-approval bump) serialize on the state mutex, which is held
//! across the platform calls of each mutation. That mutex is the sticky
//! lock: two concurrent bumps can never both observe "post exists" and
//! allocate duplicates.

use std::sync::Arc;

use coderelay_platform::reactions::TASK_TOGGLE;
use coderelay_platform::ChatClient;
use coderelay_platform::PlatformError;
use coderelay_platform::ReactionAction;
use coderelay_protocol::operation::active_task;
use coderelay_protocol::operation::task_progress;
use coderelay_protocol::operation::TaskItem;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::post_tracker::PostKind;
use crate::post_tracker::PostTracker;

#[derive(Debug, Default, Clone)]
pub struct TaskListState {
    pub post_id: Option<String>,
    pub last_rendered_body: Option<String>,
    pub completed: bool,
    pub minimized: bool,
    pub tasks: Vec<TaskItem>,
}

/// Snapshot handed to persistence and the supervisor overview.
#[derive(Debug, Clone, Default)]
pub struct TaskListSnapshot {
    pub post_id: Option<String>,
    pub last_rendered_body: Option<String>,
    pub completed: bool,
    pub minimized: bool,
    pub done: usize,
    pub total: usize,
}

pub struct TaskListExecutor {
    session_id: String,
    thread_id: String,
    client: Arc<dyn ChatClient>,
    tracker: Arc<Mutex<PostTracker>>,
    state: Mutex<TaskListState>,
}

impl TaskListExecutor {
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
            state: Mutex::new(TaskListState::default()),
        }
    }

    fn render_full(&self, tasks: &[TaskItem]) -> String {
        let f = self.client.formatter();
        let (done, total) = task_progress(tasks);
        let pct = if total == 0 { 0 } else { done * 100 / total };
        let mut out = format!("📋 {}", f.bold(&format!("Tasks ({done}/{total} · {pct}%)")));
        for task in tasks {
            out.push('\n');
            out.push_str(&self.render_item(task));
        }
        out
    }

    fn render_item(&self, task: &TaskItem) -> String {
        use coderelay_protocol::operation::TaskStatus::*;
        let f = self.client.formatter();
        match task.status {
            Completed => format!("✅ {}", f.strike(&task.content)),
            InProgress => {
                let label = task.active_form.as_deref().unwrap_or(&task.content);
                format!("🔄 {}", f.bold(label))
            }
            Pending => format!("⬜ {}", task.content),
        }
    }

    fn render_minimized(&self, tasks: &[TaskItem]) -> String {
        let f = self.client.formatter();
        let (done, total) = task_progress(tasks);
        let pct = if total == 0 { 0 } else { done * 100 / total };
        let mut out = format!("📋 {}", f.bold(&format!("Tasks ({done}/{total} · {pct}%)")));
        if let Some(task) = active_task(tasks) {
            out.push('\n');
            out.push_str(&self.render_item(task));
        }
        out
    }

    fn render_completed(&self, tasks: &[TaskItem]) -> String {
        let f = self.client.formatter();
        let (done, total) = task_progress(tasks);
        let mut out = format!("📋 {} ✅", f.strike(&format!("Tasks ({done}/{total})")));
        for task in tasks {
            out.push('\n');
            out.push_str(&format!("✅ {}", f.strike(&task.content)));
        }
        out
    }

    fn render_current(&self, state: &TaskListState) -> String {
        if state.completed {
            self.render_completed(&state.tasks)
        } else if state.minimized {
            self.render_minimized(&state.tasks)
        } else {
            self.render_full(&state.tasks)
        }
    }

    async fn create_task_post(&self, body: &str) -> Result<String> {
        let post = self
            .client
            .create_interactive_post(body, &[TASK_TOGGLE], Some(&self.thread_id))
            .await?;
        if let Err(e) = self.client.pin_post(&post.id).await {
            warn!("failed to pin task post {}: {e}", post.id);
        }
        self.tracker
            .lock()
            .await
            .register(&post.id, &self.session_id, PostKind::Task);
        Ok(post.id)
    }

    /// Render and post the task list, creating-and-pinning on first use.
    pub async fn update(&self, tasks: &[TaskItem]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.completed {
            // Terminal; the post is read-only from here on.
            return Ok(());
        }
        state.tasks = tasks.to_vec();
        let body = self.render_current(&state);

        match &state.post_id {
            Some(post_id) => match self.client.update_post(post_id, &body).await {
                Ok(()) => {}
                Err(PlatformError::PostGone(_)) => {
                    debug!("task post {post_id} vanished; recreating");
                    self.tracker.lock().await.remove(post_id);
                    state.post_id = Some(self.create_task_post(&body).await?);
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                state.post_id = Some(self.create_task_post(&body).await?);
            }
        }
        state.last_rendered_body = Some(body);
        Ok(())
    }

    /// Terminal transition: strikethrough body, unpin, never mutate again.
    pub async fn complete(&self, tasks: &[TaskItem]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.completed {
            return Ok(());
        }
        state.tasks = tasks.to_vec();
        state.completed = true;
        let body = self.render_completed(&state.tasks);

        if let Some(post_id) = state.post_id.clone() {
            match self.client.update_post(&post_id, &body).await {
                Ok(()) => {}
                Err(PlatformError::PostGone(_)) => {
                    debug!("task post {post_id} gone at completion");
                }
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = self.client.unpin_post(&post_id).await {
                debug!("failed to unpin completed task post: {e}");
            }
            if let Err(e) = self.client.remove_reaction(&post_id, TASK_TOGGLE).await {
                debug!("failed to remove task toggle reaction: {e}");
            }
        }
        state.last_rendered_body = Some(body);
        Ok(())
    }

    /// "add" collapses to the progress header plus the active task; "remove"
    /// restores the full body. Idempotent with respect to the rendered body.
    pub async fn toggle_minimize(&self, action: ReactionAction) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.completed {
            return Ok(());
        }
        state.minimized = action == ReactionAction::Added;
        let body = self.render_current(&state);
        if state.last_rendered_body.as_deref() == Some(body.as_str()) {
            return Ok(());
        }
        if let Some(post_id) = &state.post_id {
            self.client.update_post(post_id, &body).await?;
        }
        state.last_rendered_body = Some(body);
        Ok(())
    }

    /// Repurpose the task post as the next content post: overwrite it with
    /// `new_content_body`, allocate a fresh task post at the thread bottom,
    /// and return the overwritten post's id. `None` when no task post
    /// exists (or it is completed).
    pub async fn on_bump_task_list(&self, new_content_body: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(old_id) = state.post_id.clone() else {
            return Ok(None);
        };
        if state.completed {
            return Ok(None);
        }

        match self.client.update_post(&old_id, new_content_body).await {
            Ok(()) => {}
            Err(PlatformError::PostGone(_)) => {
                // Nothing to repurpose; the caller creates its own post.
                self.tracker.lock().await.remove(&old_id);
                state.post_id = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.client.remove_reaction(&old_id, TASK_TOGGLE).await {
            debug!("failed to strip toggle from repurposed post: {e}");
        }
        if let Err(e) = self.client.unpin_post(&old_id).await {
            debug!("failed to unpin repurposed post: {e}");
        }
        self.tracker
            .lock()
            .await
            .register(&old_id, &self.session_id, PostKind::Content);

        let body = match &state.last_rendered_body {
            Some(body) => body.clone(),
            None => self.render_current(&state),
        };
        state.post_id = Some(self.create_task_post(&body).await?);
        Ok(Some(old_id))
    }

    /// Delete and recreate the task post so it sits at the visual bottom of
    /// the thread, preserving body and minimize state.
    pub async fn on_bump_to_bottom(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(old_id) = state.post_id.clone() else {
            return Ok(());
        };
        if state.completed {
            return Ok(());
        }
        match self.client.delete_post(&old_id).await {
            Ok(()) | Err(PlatformError::PostGone(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.tracker.lock().await.remove(&old_id);

        let body = match &state.last_rendered_body {
            Some(body) => body.clone(),
            None => self.render_current(&state),
        };
        state.post_id = Some(self.create_task_post(&body).await?);
        Ok(())
    }

    pub async fn has_active_tasks(&self) -> bool {
        let state = self.state.lock().await;
        state.post_id.is_some() && !state.completed && !state.tasks.is_empty()
    }

    pub async fn snapshot(&self) -> TaskListSnapshot {
        let state = self.state.lock().await;
        let (done, total) = task_progress(&state.tasks);
        TaskListSnapshot {
            post_id: state.post_id.clone(),
            last_rendered_body: state.last_rendered_body.clone(),
            completed: state.completed,
            minimized: state.minimized,
            done,
            total,
        }
    }

    /// Restore state after a process restart.
    pub async fn hydrate(
        &self,
        post_id: Option<String>,
        last_rendered_body: Option<String>,
        completed: bool,
        minimized: bool,
    ) {
        let mut state = self.state.lock().await;
        state.post_id = post_id.clone();
        state.last_rendered_body = last_rendered_body;
        state.completed = completed;
        state.minimized = minimized;
        if let Some(post_id) = post_id
            && !completed
        {
            self.tracker
                .lock()
                .await
                .register(&post_id, &self.session_id, PostKind::Task);
        }
    }
}
