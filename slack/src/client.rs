//! Web API client. Slack answers every call with an `ok`/`error` envelope;
//! transport failures retry with backoff, envelope errors map to the
//! platform error vocabulary.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use coderelay_platform::ChatClient;
use coderelay_platform::Formatter;
use coderelay_platform::MessageLimits;
use coderelay_platform::MrkdwnFormatter;
use coderelay_platform::PlatformError;
use coderelay_platform::Post;
use coderelay_platform::Result;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use tracing::warn;

/// Slack truncates message text around 4k characters.
const HARD_BYTES: usize = 4_000;
const HEIGHT_SOFT: u32 = 900;

const MAX_ATTEMPTS: u64 = 3;
const API_BASE: &str = "https://slack.com/api";

fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt - 1));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base_delay_ms as f64 * jitter) as u64)
}

pub fn encode_post_id(channel: &str, ts: &str) -> String {
    format!("{channel}:{ts}")
}

/// Split a packed post id back into `(channel, ts)`.
pub fn decode_post_id(post_id: &str) -> Result<(&str, &str)> {
    post_id
        .split_once(':')
        .ok_or_else(|| PlatformError::Api(format!("malformed post id: {post_id}")))
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    #[serde(default)]
    error: String,
    #[serde(flatten)]
    rest: serde_json::Value,
}

pub struct SlackClient {
    http: reqwest::Client,
    bot_token: String,
    app_token: String,
    channel_id: String,
    bot_user_id: String,
    allowed_users: HashSet<String>,
    formatter: MrkdwnFormatter,
    api_base: String,
}

impl SlackClient {
    /// Connect and learn the bot's identity from `auth.test`.
    pub async fn connect(
        bot_token: &str,
        app_token: &str,
        channel_id: &str,
        allowed_users: Vec<String>,
    ) -> Result<Self> {
        let mut client = Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.to_string(),
            app_token: app_token.to_string(),
            channel_id: channel_id.to_string(),
            bot_user_id: String::new(),
            allowed_users: allowed_users.into_iter().collect(),
            formatter: MrkdwnFormatter,
            api_base: API_BASE.to_string(),
        };
        let auth = client.call("auth.test", json!({})).await?;
        client.bot_user_id = auth
            .rest
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(client)
    }

    pub fn app_token(&self) -> &str {
        &self.app_token
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn call(&self, api_method: &str, body: serde_json::Value) -> Result<ApiEnvelope> {
        let url = format!("{}/{api_method}", self.api_base);
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(&url)
                .bearer_auth(&self.bot_token)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    debug!("transport error on {api_method} (attempt {attempt}): {e}");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(PlatformError::Transport(e.to_string())),
            };

            if response.status().is_server_error() && attempt < MAX_ATTEMPTS {
                warn!("{api_method} returned {}; retrying", response.status());
                tokio::time::sleep(backoff(attempt)).await;
                continue;
            }

            let envelope: ApiEnvelope = response
                .json()
                .await
                .map_err(|e| PlatformError::Transport(e.to_string()))?;
            if envelope.ok {
                return Ok(envelope);
            }
            return Err(map_slack_error(&envelope.error, api_method));
        }
    }
}

fn map_slack_error(error: &str, api_method: &str) -> PlatformError {
    match error {
        "message_not_found" | "channel_not_found" | "thread_not_found" | "file_not_found" => {
            PlatformError::PostGone(api_method.to_string())
        }
        "msg_too_long" | "no_text" => PlatformError::MessageTooLong(0),
        "not_authed" | "invalid_auth" | "token_revoked" | "missing_scope" => {
            PlatformError::Unauthorized(error.to_string())
        }
        other => PlatformError::Api(other.to_string()),
    }
}

#[async_trait]
impl ChatClient for SlackClient {
    async fn create_post(&self, body: &str, thread_id: Option<&str>) -> Result<Post> {
        let mut payload = json!({
            "channel": self.channel_id,
            "text": body,
        });
        if let Some(thread_id) = thread_id {
            let (_, thread_ts) = decode_post_id(thread_id)
                .unwrap_or((self.channel_id.as_str(), thread_id));
            payload["thread_ts"] = json!(thread_ts);
        }
        let envelope = self.call("chat.postMessage", payload).await?;
        let ts = envelope
            .rest
            .get("ts")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let id = encode_post_id(&self.channel_id, &ts);
        Ok(Post {
            id: id.clone(),
            channel_id: self.channel_id.clone(),
            thread_id: thread_id.map(str::to_string).unwrap_or(id),
            author_id: self.bot_user_id.clone(),
            body: body.to_string(),
            created_at: chrono_now(&ts),
        })
    }

    async fn create_interactive_post(
        &self,
        body: &str,
        reactions: &[&str],
        thread_id: Option<&str>,
    ) -> Result<Post> {
        let post = self.create_post(body, thread_id).await?;
        for name in reactions {
            if let Err(e) = self.add_reaction(&post.id, name).await {
                debug!("failed to seed reaction {name}: {e}");
            }
        }
        Ok(post)
    }

    async fn update_post(&self, post_id: &str, body: &str) -> Result<()> {
        if body.len() > HARD_BYTES {
            return Err(PlatformError::MessageTooLong(body.len()));
        }
        let (channel, ts) = decode_post_id(post_id)?;
        self.call(
            "chat.update",
            json!({ "channel": channel, "ts": ts, "text": body }),
        )
        .await?;
        Ok(())
    }

    async fn delete_post(&self, post_id: &str) -> Result<()> {
        let (channel, ts) = decode_post_id(post_id)?;
        self.call("chat.delete", json!({ "channel": channel, "ts": ts }))
            .await?;
        Ok(())
    }

    async fn pin_post(&self, post_id: &str) -> Result<()> {
        let (channel, ts) = decode_post_id(post_id)?;
        self.call("pins.add", json!({ "channel": channel, "timestamp": ts }))
            .await?;
        Ok(())
    }

    async fn unpin_post(&self, post_id: &str) -> Result<()> {
        let (channel, ts) = decode_post_id(post_id)?;
        match self
            .call("pins.remove", json!({ "channel": channel, "timestamp": ts }))
            .await
        {
            Ok(_) => Ok(()),
            Err(PlatformError::Api(e)) if e == "no_pin" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn add_reaction(&self, post_id: &str, name: &str) -> Result<()> {
        let (channel, ts) = decode_post_id(post_id)?;
        match self
            .call(
                "reactions.add",
                json!({ "channel": channel, "timestamp": ts, "name": name }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(PlatformError::Api(e)) if e == "already_reacted" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_reaction(&self, post_id: &str, name: &str) -> Result<()> {
        let (channel, ts) = decode_post_id(post_id)?;
        match self
            .call(
                "reactions.remove",
                json!({ "channel": channel, "timestamp": ts, "name": name }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(PlatformError::Api(e)) if e == "no_reaction" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, _thread_id: &str) -> Result<()> {
        // Bots cannot publish typing indicators over the Web API.
        Ok(())
    }

    async fn username(&self, user_id: &str) -> Result<String> {
        let envelope = self.call("users.info", json!({ "user": user_id })).await?;
        Ok(envelope
            .rest
            .get("user")
            .and_then(|u| u.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or(user_id)
            .to_string())
    }

    fn formatter(&self) -> &dyn Formatter {
        &self.formatter
    }

    fn message_limits(&self) -> MessageLimits {
        MessageLimits {
            hard_bytes: HARD_BYTES,
            height_soft: HEIGHT_SOFT,
        }
    }

    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(username)
    }
}

/// Slack timestamps are `seconds.fraction` strings; fall back to now when
/// unparsable.
fn chrono_now(ts: &str) -> chrono::DateTime<chrono::Utc> {
    ts.split('.')
        .next()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(chrono::Utc::now)
}
