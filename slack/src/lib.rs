//! Slack backend: Web API for posting, Socket Mode for incoming activity.
//!
//! Slack addresses messages by `(channel, ts)`; this crate packs both into
//! the opaque post id as `channel:ts` so the core never needs to know.

mod client;
mod socket;

pub use client::SlackClient;
pub use client::decode_post_id;
pub use client::encode_post_id;
pub use socket::run_event_stream;
