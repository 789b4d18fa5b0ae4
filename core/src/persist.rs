//! Session persistence.
//!
//! One pretty-printed JSON file per session under `<data_dir>/sessions/`.
//! Persistence is a reconciliation sink, not a source of truth at runtime:
//! records are written after meaningful transitions and read once at boot
//! to resume sessions. Malformed files are deleted and skipped.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::executor::interactive::PendingApproval;
use crate::executor::interactive::PendingQuestionSet;
use crate::executor::worktree_prompt::PendingWorktreePrompt;
use coderelay_protocol::manager_event::SessionLifecycle;

const SESSIONS_SUBDIR: &str = "sessions";

/// Diagnostics ring: the last N agent event type tags.
pub const RECENT_EVENTS_CAP: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Composite id: `platform_id + ":" + thread_id`.
    pub session_id: String,
    pub platform_id: String,
    pub channel_id: String,
    pub thread_id: String,

    /// The agent's own session identifier, used for `--resume`.
    #[serde(default)]
    pub agent_session_id: Option<Uuid>,

    pub working_dir: PathBuf,
    pub owner: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,

    #[serde(default)]
    pub session_start_post_id: Option<String>,

    #[serde(default)]
    pub task_post_id: Option<String>,
    #[serde(default)]
    pub task_last_body: Option<String>,
    #[serde(default)]
    pub task_completed: bool,
    #[serde(default)]
    pub task_minimized: bool,

    #[serde(default)]
    pub pending_question: Option<PendingQuestionSet>,
    #[serde(default)]
    pub pending_approval: Option<PendingApproval>,
    #[serde(default)]
    pub pending_worktree_prompt: Option<PendingWorktreePrompt>,

    #[serde(default)]
    pub lifecycle: SessionLifecycle,
    #[serde(default)]
    pub resume_fail_count: u32,
    #[serde(default)]
    pub message_count: u64,

    #[serde(default)]
    pub first_prompt: Option<String>,
    #[serde(default)]
    pub worktree_branch: Option<String>,

    /// Ring of recent agent event type tags, newest last.
    #[serde(default)]
    pub recent_events: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn push_recent_event(&mut self, tag: &str) {
        self.recent_events.push(tag.to_string());
        let len = self.recent_events.len();
        if len > RECENT_EVENTS_CAP {
            self.recent_events.drain(..len - RECENT_EVENTS_CAP);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            dir: data_dir.join(SESSIONS_SUBDIR),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids contain `:`; keep filenames portable.
        let sanitized: String = session_id
            .chars()
            .map(|c| if c == ':' || c == '/' { '-' } else { c })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }

    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.path_for(&record.session_id), json).await?;
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every persisted record. Files that fail to parse are deleted so
    /// they cannot wedge every future boot.
    pub async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<SessionRecord>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("deleting malformed session record {}: {e}", path.display());
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        Ok(records)
    }
}
