//! WebSocket event feed.
//!
//! Mattermost pushes seq-numbered JSON envelopes; the payloads we care
//! about carry the affected post (or reaction) as a JSON-encoded string
//! inside `data`. The stream reconnects forever with capped backoff until
//! the consumer side closes.

use std::time::Duration;

use coderelay_platform::ChatEvent;
use coderelay_platform::ReactionAction;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use tracing::info;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: String,
    channel_id: String,
    #[serde(default)]
    root_id: String,
    user_id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    file_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireReaction {
    user_id: String,
    post_id: String,
    emoji_name: String,
}

fn nested_json<'a, T: serde::de::DeserializeOwned>(
    data: &'a serde_json::Value,
    key: &str,
) -> Option<T> {
    let raw = data.get(key)?.as_str()?;
    serde_json::from_str(raw).ok()
}

/// Map one envelope to a chat event, if it is one we route.
pub(crate) fn parse_event(text: &str) -> Option<ChatEvent> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    match envelope.event.as_str() {
        "posted" => {
            let post: WirePost = nested_json(&envelope.data, "post")?;
            let thread_id = if post.root_id.is_empty() {
                post.id.clone()
            } else {
                post.root_id
            };
            Some(ChatEvent::MessageCreated {
                post_id: post.id,
                channel_id: post.channel_id,
                thread_id,
                user_id: post.user_id,
                body: post.message,
                files: post.file_ids,
            })
        }
        "post_edited" => {
            let post: WirePost = nested_json(&envelope.data, "post")?;
            let thread_id = if post.root_id.is_empty() {
                post.id.clone()
            } else {
                post.root_id
            };
            Some(ChatEvent::MessageUpdated {
                post_id: post.id,
                channel_id: post.channel_id,
                thread_id,
                user_id: post.user_id,
                body: post.message,
            })
        }
        "reaction_added" | "reaction_removed" => {
            let reaction: WireReaction = nested_json(&envelope.data, "reaction")?;
            let action = if envelope.event == "reaction_added" {
                ReactionAction::Added
            } else {
                ReactionAction::Removed
            };
            Some(ChatEvent::Reaction {
                action,
                post_id: reaction.post_id,
                channel_id: String::new(),
                user_id: reaction.user_id,
                emoji: reaction.emoji_name,
            })
        }
        _ => None,
    }
}

fn ws_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{base}")
    };
    format!("{ws_base}/api/v4/websocket")
}

/// Connect and pump chat events until the receiving side goes away.
pub async fn run_event_stream(base_url: String, token: String, tx: mpsc::Sender<ChatEvent>) {
    let url = ws_url(&base_url);
    let mut attempt: u32 = 0;
    loop {
        if tx.is_closed() {
            return;
        }
        match connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                attempt = 0;
                info!("websocket connected");
                let challenge = json!({
                    "seq": 1,
                    "action": "authentication_challenge",
                    "data": { "token": token },
                });
                if let Err(e) = socket.send(Message::Text(challenge.to_string())).await {
                    warn!("failed to authenticate websocket: {e}");
                    continue;
                }

                while let Some(message) = socket.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = parse_event(&text)
                                && tx.send(event).await.is_err()
                            {
                                return;
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = socket.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("websocket read error: {e}");
                            break;
                        }
                    }
                }
                debug!("websocket stream ended; reconnecting");
            }
            Err(e) => warn!("websocket connect failed: {e}"),
        }

        attempt = attempt.saturating_add(1);
        let delay = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)));
        tokio::time::sleep(delay.min(MAX_BACKOFF)).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn posted_envelope_becomes_message_created() {
        let inner = json!({
            "id": "P2",
            "channel_id": "CHAN",
            "root_id": "P1",
            "user_id": "U7",
            "message": "hi there",
            "file_ids": ["f1"],
        })
        .to_string();
        let envelope = json!({
            "event": "posted",
            "data": { "post": inner, "channel_type": "O" },
            "seq": 4,
        })
        .to_string();

        let event = parse_event(&envelope).unwrap();
        let ChatEvent::MessageCreated {
            post_id,
            thread_id,
            user_id,
            body,
            files,
            ..
        } = event
        else {
            panic!("wrong event kind");
        };
        assert_eq!(post_id, "P2");
        assert_eq!(thread_id, "P1");
        assert_eq!(user_id, "U7");
        assert_eq!(body, "hi there");
        assert_eq!(files, vec!["f1".to_string()]);
    }

    #[test]
    fn root_posts_thread_on_themselves() {
        let inner = json!({
            "id": "P1",
            "channel_id": "CHAN",
            "user_id": "U7",
            "message": "root",
        })
        .to_string();
        let envelope = json!({"event": "posted", "data": {"post": inner}}).to_string();
        let ChatEvent::MessageCreated { thread_id, .. } = parse_event(&envelope).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(thread_id, "P1");
    }

    #[test]
    fn reaction_envelopes_map_both_directions() {
        let inner = json!({"user_id": "U7", "post_id": "P1", "emoji_name": "+1"}).to_string();
        let added = json!({"event": "reaction_added", "data": {"reaction": inner}}).to_string();
        let ChatEvent::Reaction { action, emoji, .. } = parse_event(&added).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(action, ReactionAction::Added);
        assert_eq!(emoji, "+1");

        let inner = json!({"user_id": "U7", "post_id": "P1", "emoji_name": "x"}).to_string();
        let removed = json!({"event": "reaction_removed", "data": {"reaction": inner}}).to_string();
        let ChatEvent::Reaction { action, .. } = parse_event(&removed).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(action, ReactionAction::Removed);
    }

    #[test]
    fn hello_and_status_envelopes_are_ignored() {
        assert!(parse_event(r#"{"event":"hello","data":{}}"#).is_none());
        assert!(parse_event(r#"{"status":"OK","seq_reply":1}"#).is_none());
        assert!(parse_event("not json").is_none());
    }

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(
            ws_url("https://chat.example.com/"),
            "wss://chat.example.com/api/v4/websocket"
        );
        assert_eq!(
            ws_url("http://localhost:8065"),
            "ws://localhost:8065/api/v4/websocket"
        );
    }
}
