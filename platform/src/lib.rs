//! The chat-platform seam.
//!
//! Everything the session pipeline needs from a chat backend is defined
//! here: an async [`ChatClient`] for posting, a [`Formatter`] so callers
//! never concatenate platform-specific syntax, the incoming [`ChatEvent`]
//! stream type, and the semantic reaction vocabulary.

mod client;
mod event;
mod formatter;
pub mod reactions;

pub use client::ChatClient;
pub use client::MessageLimits;
pub use client::PlatformError;
pub use client::Post;
pub use client::Result;
pub use event::ChatEvent;
pub use event::ReactionAction;
pub use formatter::Formatter;
pub use formatter::MarkdownFormatter;
pub use formatter::MrkdwnFormatter;
