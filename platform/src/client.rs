use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::formatter::Formatter;

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Errors surfaced across the platform seam. Transient transport failures
/// are retried inside the clients; what crosses this boundary is either
/// success, a recoverable post-level condition, or a final failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PlatformError {
    /// The post no longer exists (deleted, or the platform expired it).
    /// Callers recover by creating a fresh post.
    #[error("post not found: {0}")]
    PostGone(String),

    /// The body exceeds the platform's hard message limit. Callers recover
    /// by splitting.
    #[error("message too long ({0} bytes)")]
    MessageTooLong(usize),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Transport failure that survived the client's bounded retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// The platform rejected the request with an application-level error.
    #[error("platform rejected request: {0}")]
    Api(String),
}

/// A message on the chat platform. Ids are opaque to the core; Slack packs
/// `channel:ts` into them, Mattermost uses native post ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Post {
    pub id: String,
    pub channel_id: String,
    /// Root post id of the thread this post belongs to. Equal to `id` for
    /// thread roots.
    pub thread_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Sizing the platform reports for a single post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    /// Hard maximum body size the platform accepts.
    pub hard_bytes: usize,
    /// Soft budget for estimated rendered height, in pixels.
    pub height_soft: u32,
}

/// The surface the session pipeline consumes. Implementations perform
/// bounded retry with backoff internally; every async method is a
/// suspension point for the session's work loop.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn create_post(&self, body: &str, thread_id: Option<&str>) -> Result<Post>;

    /// Create a post and seed it with reaction controls in one step.
    async fn create_interactive_post(
        &self,
        body: &str,
        reactions: &[&str],
        thread_id: Option<&str>,
    ) -> Result<Post>;

    async fn update_post(&self, post_id: &str, body: &str) -> Result<()>;

    async fn delete_post(&self, post_id: &str) -> Result<()>;

    async fn pin_post(&self, post_id: &str) -> Result<()>;

    async fn unpin_post(&self, post_id: &str) -> Result<()>;

    async fn add_reaction(&self, post_id: &str, name: &str) -> Result<()>;

    async fn remove_reaction(&self, post_id: &str, name: &str) -> Result<()>;

    async fn send_typing(&self, thread_id: &str) -> Result<()>;

    async fn username(&self, user_id: &str) -> Result<String>;

    fn formatter(&self) -> &dyn Formatter;

    fn message_limits(&self) -> MessageLimits;

    fn bot_user_id(&self) -> &str;

    /// Global allow policy: users outside a session's allowed set may still
    /// interact when the platform config allows them everywhere.
    fn is_user_allowed(&self, username: &str) -> bool;
}
