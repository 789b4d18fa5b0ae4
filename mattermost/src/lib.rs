//! Mattermost backend: REST v4 for posting and a WebSocket feed for
//! incoming activity.

mod client;
mod ws;

pub use client::MattermostClient;
pub use ws::run_event_stream;
