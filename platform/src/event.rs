use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Incoming chat activity, pushed by a platform client onto the channel the
/// router consumes. Thread ids are always the *root* post id; clients
/// resolve replies to their root before emitting.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ChatEvent {
    MessageCreated {
        post_id: String,
        channel_id: String,
        thread_id: String,
        user_id: String,
        body: String,
        /// File attachment identifiers, when the platform carries any.
        files: Vec<String>,
    },
    MessageUpdated {
        post_id: String,
        channel_id: String,
        thread_id: String,
        user_id: String,
        body: String,
    },
    Reaction {
        action: ReactionAction,
        post_id: String,
        channel_id: String,
        user_id: String,
        emoji: String,
    },
}
