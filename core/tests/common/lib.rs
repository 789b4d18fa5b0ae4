#![allow(clippy::expect_used, clippy::unwrap_used)]

//! In-memory chat platform double for pipeline tests: records every call,
//! serves configurable limits, and can be told to fail the next update so
//! recovery paths are exercisable without a server.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use coderelay_platform::ChatClient;
use coderelay_platform::Formatter;
use coderelay_platform::MarkdownFormatter;
use coderelay_platform::MessageLimits;
use coderelay_platform::PlatformError;
use coderelay_platform::Post;
use coderelay_platform::Result;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub id: String,
    pub thread_id: Option<String>,
    pub body: String,
    /// Every body this post has ever had, oldest first.
    pub history: Vec<String>,
    pub reactions: HashSet<String>,
    pub pinned: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    PostGone,
    TooLong,
}

#[derive(Default)]
struct State {
    next_id: u64,
    posts: Vec<RecordedPost>,
    /// Chronological call log, e.g. `create p1`, `update p1`, `pin p2`.
    log: Vec<String>,
    fail_next_update: Option<FailKind>,
}

pub struct RecordingClient {
    state: Mutex<State>,
    limits: MessageLimits,
    formatter: MarkdownFormatter,
    bot_user_id: String,
    usernames: HashMap<String, String>,
    allowed: HashSet<String>,
}

impl RecordingClient {
    pub fn new(hard_bytes: usize) -> Arc<Self> {
        let mut usernames = HashMap::new();
        usernames.insert("U_OWNER".to_string(), "owner".to_string());
        usernames.insert("U_ALLY".to_string(), "ally".to_string());
        usernames.insert("U_RANDO".to_string(), "rando".to_string());
        usernames.insert("U_BOT".to_string(), "relay-bot".to_string());
        Arc::new(Self {
            state: Mutex::new(State::default()),
            limits: MessageLimits {
                hard_bytes,
                height_soft: 100_000,
            },
            formatter: MarkdownFormatter,
            bot_user_id: "U_BOT".to_string(),
            usernames,
            allowed: HashSet::from(["ally".to_string()]),
        })
    }

    pub async fn fail_next_update(&self, kind: FailKind) {
        self.state.lock().await.fail_next_update = Some(kind);
    }

    pub async fn post(&self, post_id: &str) -> Option<RecordedPost> {
        self.state
            .lock()
            .await
            .posts
            .iter()
            .find(|p| p.id == post_id)
            .cloned()
    }

    pub async fn posts(&self) -> Vec<RecordedPost> {
        self.state.lock().await.posts.clone()
    }

    /// Bodies of live posts in creation order.
    pub async fn live_bodies(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .posts
            .iter()
            .filter(|p| !p.deleted)
            .map(|p| p.body.clone())
            .collect()
    }

    pub async fn log(&self) -> Vec<String> {
        self.state.lock().await.log.clone()
    }

    pub async fn create_count(&self) -> usize {
        self.state.lock().await.posts.len()
    }

    fn make_post(state: &mut State, body: &str, thread_id: Option<&str>) -> Post {
        state.next_id += 1;
        let id = format!("p{}", state.next_id);
        state.posts.push(RecordedPost {
            id: id.clone(),
            thread_id: thread_id.map(str::to_string),
            body: body.to_string(),
            history: vec![body.to_string()],
            reactions: HashSet::new(),
            pinned: false,
            deleted: false,
        });
        state.log.push(format!("create {id}"));
        Post {
            id,
            channel_id: "C1".to_string(),
            thread_id: thread_id.unwrap_or("ROOT").to_string(),
            author_id: "U_BOT".to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ChatClient for RecordingClient {
    async fn create_post(&self, body: &str, thread_id: Option<&str>) -> Result<Post> {
        if body.len() > self.limits.hard_bytes {
            return Err(PlatformError::MessageTooLong(body.len()));
        }
        let mut state = self.state.lock().await;
        Ok(Self::make_post(&mut state, body, thread_id))
    }

    async fn create_interactive_post(
        &self,
        body: &str,
        reactions: &[&str],
        thread_id: Option<&str>,
    ) -> Result<Post> {
        let mut state = self.state.lock().await;
        let post = Self::make_post(&mut state, body, thread_id);
        if let Some(recorded) = state.posts.iter_mut().find(|p| p.id == post.id) {
            for name in reactions {
                recorded.reactions.insert((*name).to_string());
            }
        }
        Ok(post)
    }

    async fn update_post(&self, post_id: &str, body: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(kind) = state.fail_next_update.take() {
            state.log.push(format!("update-fail {post_id}"));
            return Err(match kind {
                FailKind::PostGone => PlatformError::PostGone(post_id.to_string()),
                FailKind::TooLong => PlatformError::MessageTooLong(body.len()),
            });
        }
        if body.len() > self.limits.hard_bytes {
            return Err(PlatformError::MessageTooLong(body.len()));
        }
        let Some(post) = state
            .posts
            .iter_mut()
            .find(|p| p.id == post_id && !p.deleted)
        else {
            return Err(PlatformError::PostGone(post_id.to_string()));
        };
        post.body = body.to_string();
        post.history.push(body.to_string());
        state.log.push(format!("update {post_id}"));
        Ok(())
    }

    async fn delete_post(&self, post_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) else {
            return Err(PlatformError::PostGone(post_id.to_string()));
        };
        post.deleted = true;
        state.log.push(format!("delete {post_id}"));
        Ok(())
    }

    async fn pin_post(&self, post_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
            post.pinned = true;
        }
        state.log.push(format!("pin {post_id}"));
        Ok(())
    }

    async fn unpin_post(&self, post_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
            post.pinned = false;
        }
        state.log.push(format!("unpin {post_id}"));
        Ok(())
    }

    async fn add_reaction(&self, post_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
            post.reactions.insert(name.to_string());
        }
        state.log.push(format!("react {post_id} {name}"));
        Ok(())
    }

    async fn remove_reaction(&self, post_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
            post.reactions.remove(name);
        }
        state.log.push(format!("unreact {post_id} {name}"));
        Ok(())
    }

    async fn send_typing(&self, _thread_id: &str) -> Result<()> {
        Ok(())
    }

    async fn username(&self, user_id: &str) -> Result<String> {
        Ok(self
            .usernames
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string()))
    }

    fn formatter(&self) -> &dyn Formatter {
        &self.formatter
    }

    fn message_limits(&self) -> MessageLimits {
        self.limits
    }

    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed.contains(username)
    }
}
