//! Routing metadata for posts the bot has authored.
//!
//! One tracker is shared by the whole fleet: reactions arrive with nothing
//! but a post id, and this map is how they find their session and the
//! executor that owns the post.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostKind {
    /// A link in the session's ordered content chain.
    Content,
    Task,
    Approval,
    Question,
    WorktreePrompt,
    UpdatePrompt,
    BugReport,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostEntry {
    pub session_id: String,
    pub kind: PostKind,
}

/// Maps post ids to `{session, kind}`. No I/O; mutated only under the
/// owning session's work loop (or the supervisor, for removal).
#[derive(Debug, Default)]
pub struct PostTracker {
    posts: HashMap<String, PostEntry>,
}

impl PostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, post_id: &str, session_id: &str, kind: PostKind) {
        self.posts.insert(
            post_id.to_string(),
            PostEntry {
                session_id: session_id.to_string(),
                kind,
            },
        );
    }

    pub fn lookup(&self, post_id: &str) -> Option<&PostEntry> {
        self.posts.get(post_id)
    }

    pub fn remove(&mut self, post_id: &str) -> Option<PostEntry> {
        self.posts.remove(post_id)
    }

    pub fn remove_by_session(&mut self, session_id: &str) {
        self.posts.retain(|_, entry| entry.session_id != session_id);
    }
}
