//! Socket Mode event feed.
//!
//! `apps.connections.open` (app-level token) hands back a WebSocket URL;
//! Slack then pushes envelopes that must be acked by `envelope_id`. The
//! loop reconnects forever with capped backoff until the consumer closes.

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

use crate::client::encode_post_id;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SocketEnvelope {
    #[serde(default)]
    envelope_id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    files: Vec<SlackFile>,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    item: Option<ReactionItem>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ReactionItem {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    ts: String,
}

/// Map one events-api payload to a chat event, if it is one we route.
pub(crate) fn parse_event(payload: &serde_json::Value) -> Option<ChatEvent> {
    let event: MessageEvent = serde_json::from_value(payload.get("event")?.clone()).ok()?;
    match event.kind.as_str() {
        "message" => {
            // Bot echoes and structural subtypes (joins, edits) are not
            // user messages.
            if event.subtype.is_some() || event.user.is_empty() {
                return None;
            }
            let post_id = encode_post_id(&event.channel, &event.ts);
            let thread_id = match &event.thread_ts {
                Some(thread_ts) => encode_post_id(&event.channel, thread_ts),
                None => post_id.clone(),
            };
            Some(ChatEvent::MessageCreated {
                post_id,
                channel_id: event.channel,
                thread_id,
                user_id: event.user,
                body: event.text,
                files: event.files.into_iter().map(|f| f.id).collect(),
            })
        }
        "reaction_added" | "reaction_removed" => {
            let item = event.item?;
            let action = if event.kind == "reaction_added" {
                ReactionAction::Added
            } else {
                ReactionAction::Removed
            };
            Some(ChatEvent::Reaction {
                action,
                post_id: encode_post_id(&item.channel, &item.ts),
                channel_id: item.channel,
                user_id: event.user,
                emoji: event.reaction.unwrap_or_default(),
            })
        }
        _ => None,
    }
}

async fn open_socket_url(http: &reqwest::Client, app_token: &str) -> Option<String> {
    let response = http
        .post("https://slack.com/api/apps.connections.open")
        .bearer_auth(app_token)
        .send()
        .await
        .ok()?;
    let body: serde_json::Value = response.json().await.ok()?;
    if !body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        warn!(
            "apps.connections.open failed: {}",
            body.get("error").and_then(|v| v.as_str()).unwrap_or("?")
        );
        return None;
    }
    body.get("url").and_then(|v| v.as_str()).map(str::to_string)
}

/// Connect Socket Mode and pump chat events until the receiver goes away.
pub async fn run_event_stream(app_token: String, tx: mpsc::Sender<ChatEvent>) {
    let http = reqwest::Client::new();
    let mut attempt: u32 = 0;
    loop {
        if tx.is_closed() {
            return;
        }
        let Some(url) = open_socket_url(&http, &app_token).await else {
            attempt = attempt.saturating_add(1);
            let delay = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)));
            tokio::time::sleep(delay.min(MAX_BACKOFF)).await;
            continue;
        };

        match connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                attempt = 0;
                info!("socket mode connected");
                while let Some(message) = socket.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            let Ok(envelope) = serde_json::from_str::<SocketEnvelope>(&text)
                            else {
                                continue;
                            };
                            if !envelope.envelope_id.is_empty() {
                                let ack = json!({ "envelope_id": envelope.envelope_id });
                                if let Err(e) = socket.send(Message::Text(ack.to_string())).await {
                                    warn!("failed to ack envelope: {e}");
                                    break;
                                }
                            }
                            match envelope.kind.as_str() {
                                "events_api" => {
                                    if let Some(event) = parse_event(&envelope.payload)
                                        && tx.send(event).await.is_err()
                                    {
                                        return;
                                    }
                                }
                                "disconnect" => {
                                    debug!("server asked for a reconnect");
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = socket.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("socket mode read error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("socket mode connect failed: {e}"),
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
    use serde_json::json;

    use super::*;

    #[test]
    fn thread_replies_use_the_thread_root() {
        let payload = json!({
            "event": {
                "type": "message",
                "user": "U7",
                "text": "reply",
                "ts": "2.0",
                "thread_ts": "1.0",
                "channel": "C1",
            }
        });
        let ChatEvent::MessageCreated {
            post_id, thread_id, ..
        } = parse_event(&payload).unwrap()
        else {
            panic!("wrong event kind");
        };
        assert_eq!(post_id, "C1:2.0");
        assert_eq!(thread_id, "C1:1.0");
    }

    #[test]
    fn bot_and_subtype_messages_are_dropped() {
        let payload = json!({
            "event": {
                "type": "message",
                "subtype": "bot_message",
                "text": "beep",
                "ts": "2.0",
                "channel": "C1",
            }
        });
        assert!(parse_event(&payload).is_none());
    }

    #[test]
    fn reactions_carry_the_packed_post_id() {
        let payload = json!({
            "event": {
                "type": "reaction_added",
                "user": "U7",
                "reaction": "one",
                "ts": "9.0",
                "item": { "channel": "C1", "ts": "3.0" },
            }
        });
        let ChatEvent::Reaction {
            action,
            post_id,
            emoji,
            ..
        } = parse_event(&payload).unwrap()
        else {
            panic!("wrong event kind");
        };
        assert_eq!(action, ReactionAction::Added);
        assert_eq!(post_id, "C1:3.0");
        assert_eq!(emoji, "one");
    }

    #[test]
    fn unrelated_events_are_ignored() {
        assert!(parse_event(&json!({"event": {"type": "app_mention", "ts": "1.0"}})).is_none());
        assert!(parse_event(&json!({})).is_none());
    }
}
