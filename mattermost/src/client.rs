//! REST v4 client. Transient failures retry with jittered exponential
//! backoff inside this layer; callers only see success, a recoverable
//! post-level condition, or a final failure.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use coderelay_platform::ChatClient;
use coderelay_platform::Formatter;
use coderelay_platform::MarkdownFormatter;
use coderelay_platform::MessageLimits;
use coderelay_platform::PlatformError;
use coderelay_platform::Post;
use coderelay_platform::Result;
use rand::Rng;
use reqwest::Method;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use tracing::warn;

/// Mattermost's default `maxPostSize`.
const HARD_BYTES: usize = 16_383;
const HEIGHT_SOFT: u32 = 1_400;

const MAX_ATTEMPTS: u64 = 3;

fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt - 1));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base_delay_ms as f64 * jitter) as u64)
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    id: String,
    channel_id: String,
    #[serde(default)]
    root_id: String,
    user_id: String,
    #[serde(default)]
    message: String,
    /// Milliseconds since epoch.
    create_at: i64,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    username: String,
}

pub struct MattermostClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    channel_id: String,
    bot_user_id: String,
    allowed_users: HashSet<String>,
    formatter: MarkdownFormatter,
}

impl MattermostClient {
    /// Connect and learn the bot's own identity from `/users/me`.
    pub async fn connect(
        base_url: &str,
        token: &str,
        channel_id: &str,
        allowed_users: Vec<String>,
    ) -> Result<Self> {
        let mut client = Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            channel_id: channel_id.to_string(),
            bot_user_id: String::new(),
            allowed_users: allowed_users.into_iter().collect(),
            formatter: MarkdownFormatter,
        };
        let me: UserResponse = client.request(Method::GET, "/api/v4/users/me", None).await?;
        client.bot_user_id = me.id;
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token);
            if let Some(body) = &body {
                req = req.json(body);
            }
            let response = match req.send().await {
                Ok(response) => response,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    debug!("transport error on {path} (attempt {attempt}): {e}");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(PlatformError::Transport(e.to_string())),
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| PlatformError::Transport(e.to_string()));
            }
            if status.is_server_error() && attempt < MAX_ATTEMPTS {
                warn!("{path} returned {status} (attempt {attempt}); retrying");
                tokio::time::sleep(backoff(attempt)).await;
                continue;
            }

            let api_error: ApiError = response.json().await.unwrap_or(ApiError {
                id: String::new(),
                message: status.to_string(),
            });
            return Err(map_api_error(status, api_error, path));
        }
    }

    fn post_from(&self, response: PostResponse) -> Post {
        let thread_id = if response.root_id.is_empty() {
            response.id.clone()
        } else {
            response.root_id
        };
        Post {
            id: response.id,
            channel_id: response.channel_id,
            thread_id,
            author_id: response.user_id,
            body: response.message,
            created_at: chrono::DateTime::from_timestamp_millis(response.create_at)
                .unwrap_or_default(),
        }
    }
}

fn map_api_error(status: StatusCode, error: ApiError, path: &str) -> PlatformError {
    if status == StatusCode::NOT_FOUND {
        return PlatformError::PostGone(path.to_string());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return PlatformError::Unauthorized(error.message);
    }
    if status == StatusCode::BAD_REQUEST
        && (error.id.contains("msg_too_long") || error.message.contains("length"))
    {
        return PlatformError::MessageTooLong(0);
    }
    PlatformError::Api(format!("{status}: {}", error.message))
}

#[async_trait]
impl ChatClient for MattermostClient {
    async fn create_post(&self, body: &str, thread_id: Option<&str>) -> Result<Post> {
        let response: PostResponse = self
            .request(
                Method::POST,
                "/api/v4/posts",
                Some(json!({
                    "channel_id": self.channel_id,
                    "message": body,
                    "root_id": thread_id.unwrap_or(""),
                })),
            )
            .await?;
        Ok(self.post_from(response))
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
        let _: PostResponse = self
            .request(
                Method::PUT,
                &format!("/api/v4/posts/{post_id}/patch"),
                Some(json!({ "message": body })),
            )
            .await?;
        Ok(())
    }

    async fn delete_post(&self, post_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(Method::DELETE, &format!("/api/v4/posts/{post_id}"), None)
            .await?;
        Ok(())
    }

    async fn pin_post(&self, post_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(Method::POST, &format!("/api/v4/posts/{post_id}/pin"), None)
            .await?;
        Ok(())
    }

    async fn unpin_post(&self, post_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(Method::POST, &format!("/api/v4/posts/{post_id}/unpin"), None)
            .await?;
        Ok(())
    }

    async fn add_reaction(&self, post_id: &str, name: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/api/v4/reactions",
                Some(json!({
                    "user_id": self.bot_user_id,
                    "post_id": post_id,
                    "emoji_name": name,
                })),
            )
            .await?;
        Ok(())
    }

    async fn remove_reaction(&self, post_id: &str, name: &str) -> Result<()> {
        let path = format!(
            "/api/v4/users/{}/posts/{post_id}/reactions/{name}",
            self.bot_user_id
        );
        match self
            .request::<serde_json::Value>(Method::DELETE, &path, None)
            .await
        {
            Ok(_) => Ok(()),
            // Removing a reaction that is not there is not an error worth
            // surfacing.
            Err(PlatformError::PostGone(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, thread_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/api/v4/users/me/typing",
                Some(json!({
                    "channel_id": self.channel_id,
                    "parent_id": thread_id,
                })),
            )
            .await?;
        Ok(())
    }

    async fn username(&self, user_id: &str) -> Result<String> {
        let user: UserResponse = self
            .request(Method::GET, &format!("/api/v4/users/{user_id}"), None)
            .await?;
        Ok(user.username)
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
