//! Buffers content operations and serializes them to the chat.
//!
//! Appends never block: bytes accumulate in `pending_body` until a flush
//! pushes them out as post creates/updates, splitting at logical break
//! points when a body outgrows the platform's limits. The flush loop runs
//! under the session's single-threaded work loop, so it is mutually
//! exclusive with itself by construction.

use std::sync::Arc;

use coderelay_platform::ChatClient;
use coderelay_platform::MessageLimits;
use coderelay_platform::PlatformError;
use coderelay_protocol::operation::FlushReason;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::debug;
use tracing::warn;

use crate::content_breaker::choose_split;
use crate::content_breaker::estimate_rendered_height;
use crate::content_breaker::should_flush_early;
use crate::content_breaker::soft_limit;
use crate::content_breaker::SplitDecision;
use crate::error::Result;
use crate::executor::task_list::TaskListExecutor;
use crate::post_tracker::PostKind;
use crate::post_tracker::PostTracker;

/// Debounce window between an append and the flush it schedules.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(700);

pub struct ContentExecutor {
    session_id: String,
    thread_id: String,
    client: Arc<dyn ChatClient>,
    tracker: Arc<Mutex<PostTracker>>,

    current_post_id: Option<String>,
    current_post_body: String,
    pending_body: String,

    flush_tx: mpsc::UnboundedSender<FlushReason>,
    timer: Option<JoinHandle<()>>,
}

impl ContentExecutor {
    /// Returns the executor and the receiver its debounce timer fires into;
    /// the session's work loop turns each tick into a `flush()` call.
    pub fn new(
        session_id: String,
        thread_id: String,
        client: Arc<dyn ChatClient>,
        tracker: Arc<Mutex<PostTracker>>,
    ) -> (Self, mpsc::UnboundedReceiver<FlushReason>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                thread_id,
                client,
                tracker,
                current_post_id: None,
                current_post_body: String::new(),
                pending_body: String::new(),
                flush_tx,
                timer: None,
            },
            flush_rx,
        )
    }

    /// Concatenate onto the pending buffer. A `block` append gets a
    /// paragraph separator unless the buffer already ends with one.
    pub fn append(&mut self, body: &str, block: bool) {
        if body.is_empty() {
            return;
        }
        if block && !self.pending_body.is_empty() && !self.pending_body.ends_with("\n\n") {
            self.pending_body.push_str("\n\n");
        }
        self.pending_body.push_str(body);
    }

    /// True once the buffer is large enough that waiting for the debounce
    /// timer costs more than it saves.
    pub fn should_flush_early(&self) -> bool {
        let limits = self.client.message_limits();
        should_flush_early(&self.pending_body, soft_limit(limits.hard_bytes))
    }

    /// Single-slot debounce: arming while armed is a no-op; exactly one
    /// flush fires.
    pub fn schedule_flush(&mut self, delay: Duration) {
        if let Some(timer) = &self.timer {
            if !timer.is_finished() {
                return;
            }
            self.timer = None;
        }
        let tx = self.flush_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(FlushReason::Timer);
        }));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_body.is_empty()
    }

    /// Close the chain: the next flush starts a fresh post. The pending
    /// buffer is untouched.
    pub fn close_current_post(&mut self) {
        self.current_post_id = None;
        self.current_post_body.clear();
    }

    /// Cancel the timer and drop buffered content; the post chain continues
    /// on the next flush.
    pub fn reset(&mut self) {
        self.disarm_timer();
        self.pending_body.clear();
    }

    fn fits(body: &str, limits: MessageLimits) -> bool {
        body.len() <= limits.hard_bytes && estimate_rendered_height(body) <= limits.height_soft
    }

    /// Serialize pending content to the chat. Every byte appended so far
    /// either lands in a content post or stays in `pending_body` for the
    /// next attempt; nothing is dropped or written twice.
    pub async fn flush(&mut self, task_list: &TaskListExecutor) -> Result<()> {
        self.disarm_timer();
        let limits = self.client.message_limits();

        loop {
            if self.pending_body.is_empty() {
                return Ok(());
            }

            let Some(post_id) = self.current_post_id.clone() else {
                self.open_post(task_list, limits).await?;
                continue;
            };

            let separator = if self.current_post_body.is_empty()
                || self.current_post_body.ends_with("\n\n")
            {
                ""
            } else {
                "\n\n"
            };
            let combined = format!("{}{separator}{}", self.current_post_body, self.pending_body);

            if Self::fits(&combined, limits) {
                match self.client.update_post(&post_id, &combined).await {
                    Ok(()) => {
                        self.current_post_body = combined;
                        self.pending_body.clear();
                        return Ok(());
                    }
                    Err(PlatformError::PostGone(_)) | Err(PlatformError::MessageTooLong(_)) => {
                        // Recoverable: reissue as a fresh post with only the
                        // pending bytes; the old body is already on the
                        // platform (or lost with the post).
                        warn!("update of content post {post_id} failed; reopening chain");
                        self.close_current_post();
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            // Overflow: cut `combined` at the best logical break.
            match self.split_decision(&combined, limits) {
                SplitDecision::UpdateWhole => {
                    // One open fence from position 0; splitting inside it
                    // would corrupt rendering, so update in place.
                    match self.client.update_post(&post_id, &combined).await {
                        Ok(()) => {
                            self.current_post_body = combined;
                            self.pending_body.clear();
                            return Ok(());
                        }
                        Err(PlatformError::PostGone(_)) | Err(PlatformError::MessageTooLong(_)) => {
                            self.close_current_post();
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                SplitDecision::At(pos) => {
                    let first = combined[..pos].to_string();
                    match self.client.update_post(&post_id, &first).await {
                        Ok(()) => {
                            // The remainder replaces the pending buffer; any
                            // bytes appended mid-update are already part of
                            // `combined` and therefore of the remainder.
                            self.close_current_post();
                            self.pending_body = combined[pos..].to_string();
                            continue;
                        }
                        Err(PlatformError::PostGone(_)) | Err(PlatformError::MessageTooLong(_)) => {
                            self.close_current_post();
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn split_decision(&self, body: &str, limits: MessageLimits) -> SplitDecision {
        if body.len() > limits.hard_bytes {
            choose_split(body, limits.hard_bytes)
        } else {
            // Within the byte limit but too tall: any logical break works.
            choose_split(body, body.len())
        }
    }

    /// Start a new content post from the front of the pending buffer,
    /// repurposing the task post when one is available.
    async fn open_post(&mut self, task_list: &TaskListExecutor, limits: MessageLimits) -> Result<()> {
        let chunk_end = if Self::fits(&self.pending_body, limits) {
            self.pending_body.len()
        } else {
            match self.split_decision(&self.pending_body, limits) {
                SplitDecision::At(pos) => pos,
                SplitDecision::UpdateWhole if self.pending_body.len() <= limits.hard_bytes => {
                    self.pending_body.len()
                }
                SplitDecision::UpdateWhole => {
                    // A single fence larger than the hard limit cannot be
                    // posted whole; cut at the last newline under the limit
                    // to keep making progress.
                    let limit =
                        crate::content_breaker::floor_char_boundary(&self.pending_body, limits.hard_bytes);
                    self.pending_body[..limit]
                        .rfind('\n')
                        .map(|idx| idx + 1)
                        .unwrap_or(limit)
                }
            }
        };
        let chunk = self.pending_body[..chunk_end].to_string();

        if let Some(adopted) = task_list.on_bump_task_list(&chunk).await? {
            debug!("adopted repurposed task post {adopted} as content");
            self.current_post_id = Some(adopted);
        } else {
            let post = self
                .client
                .create_post(&chunk, Some(&self.thread_id))
                .await?;
            self.tracker
                .lock()
                .await
                .register(&post.id, &self.session_id, PostKind::Content);
            self.current_post_id = Some(post.id);
            // A fresh content post pushed the task list up; move it back to
            // the bottom so it stays in view.
            if task_list.has_active_tasks().await {
                task_list.on_bump_to_bottom().await?;
            }
        }
        self.current_post_body = chunk;
        self.pending_body.drain(..chunk_end);
        Ok(())
    }
}
