//! Application configuration loaded from disk and merged with CLI overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayErr;
use crate::error::Result;

const CONFIG_TOML_FILE: &str = "config.toml";

/// Default ceiling on concurrently hosted sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

const DEFAULT_IDLE_WARN_MINUTES: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Every privileged agent action asks in the thread.
    #[default]
    Interactive,
    /// The agent runs with auto-approval; nothing is escalated to chat.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    Mattermost,
    Slack,
}

/// Serde view of `~/.coderelay/config.toml`. Every field is optional so a
/// partial file merges cleanly with defaults and CLI overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub platform: Option<PlatformKind>,

    /// Mattermost server base URL, e.g. `https://chat.example.com`.
    pub mattermost_url: Option<String>,
    pub mattermost_token: Option<String>,

    /// Slack bot token (`xoxb-...`) and app-level token (`xapp-...`) for
    /// Socket Mode.
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,

    /// The home channel new posts land in when no thread is given.
    pub channel: Option<String>,

    /// Command used to launch the agent subprocess; first token is the
    /// binary.
    pub agent_cmd: Option<Vec<String>>,

    pub max_sessions: Option<usize>,
    pub idle_warn_minutes: Option<u64>,
    pub idle_timeout_minutes: Option<u64>,

    /// Usernames allowed to use the bot in any thread.
    pub allowed_users: Option<Vec<String>>,

    pub permission_mode: Option<PermissionMode>,

    /// Where session records live. Defaults to `~/.coderelay`.
    pub data_dir: Option<PathBuf>,

    /// Directory new sessions start in. Defaults to the bot's own working
    /// directory.
    pub working_dir: Option<PathBuf>,

    /// Include full tool inputs in formatted tool lines.
    pub detailed: Option<bool>,

    /// Offer a worktree branch prompt when a session starts in a git repo.
    pub worktrees: Option<bool>,
}

/// CLI-sourced overrides; `None` means "not specified on the command line".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub platform: Option<PlatformKind>,
    pub agent_cmd: Option<Vec<String>>,
    pub max_sessions: Option<usize>,
    pub data_dir: Option<PathBuf>,
}

/// Fully merged runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub platform: PlatformKind,
    pub mattermost_url: Option<String>,
    pub mattermost_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,
    pub channel: Option<String>,

    pub agent_cmd: Vec<String>,
    pub max_sessions: usize,
    pub idle_warn: Duration,
    pub idle_timeout: Duration,
    pub allowed_users: Vec<String>,
    pub permission_mode: PermissionMode,
    pub data_dir: PathBuf,
    pub working_dir: PathBuf,
    pub detailed: bool,
    pub worktrees: bool,
}

impl Config {
    pub fn load(path: Option<&PathBuf>, overrides: ConfigOverrides) -> Result<Self> {
        let toml_path = match path {
            Some(p) => p.clone(),
            None => relay_dir()?.join(CONFIG_TOML_FILE),
        };
        let cfg: ConfigToml = match std::fs::read_to_string(&toml_path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| RelayErr::Config(format!("{}: {e}", toml_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(e) => return Err(e.into()),
        };
        Self::from_base_config_with_overrides(cfg, overrides)
    }

    pub fn from_base_config_with_overrides(
        cfg: ConfigToml,
        overrides: ConfigOverrides,
    ) -> Result<Self> {
        let platform = overrides
            .platform
            .or(cfg.platform)
            .ok_or_else(|| RelayErr::Config("no platform configured".to_string()))?;

        let agent_cmd = overrides
            .agent_cmd
            .or(cfg.agent_cmd)
            .unwrap_or_else(|| vec!["claude".to_string()]);
        if agent_cmd.is_empty() {
            return Err(RelayErr::Config("agent_cmd must not be empty".to_string()));
        }

        let data_dir = match overrides.data_dir.or(cfg.data_dir) {
            Some(dir) => dir,
            None => relay_dir()?,
        };

        Ok(Self {
            platform,
            mattermost_url: cfg.mattermost_url,
            mattermost_token: cfg.mattermost_token,
            slack_bot_token: cfg.slack_bot_token,
            slack_app_token: cfg.slack_app_token,
            channel: cfg.channel,
            agent_cmd,
            max_sessions: overrides
                .max_sessions
                .or(cfg.max_sessions)
                .unwrap_or(DEFAULT_MAX_SESSIONS),
            idle_warn: Duration::from_secs(
                cfg.idle_warn_minutes.unwrap_or(DEFAULT_IDLE_WARN_MINUTES) * 60,
            ),
            idle_timeout: Duration::from_secs(
                cfg.idle_timeout_minutes
                    .unwrap_or(DEFAULT_IDLE_TIMEOUT_MINUTES)
                    * 60,
            ),
            allowed_users: cfg.allowed_users.unwrap_or_default(),
            permission_mode: cfg.permission_mode.unwrap_or_default(),
            data_dir,
            working_dir: match cfg.working_dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            },
            detailed: cfg.detailed.unwrap_or(false),
            worktrees: cfg.worktrees.unwrap_or(false),
        })
    }
}

/// Returns the path to the coderelay directory (`~/.coderelay`), creating
/// nothing.
pub fn relay_dir() -> Result<PathBuf> {
    let mut home = dirs::home_dir()
        .ok_or_else(|| RelayErr::Config("could not resolve home directory".to_string()))?;
    home.push(".coderelay");
    Ok(home)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_toml_merges_with_defaults() {
        let cfg: ConfigToml = toml::from_str(
            r#"
            platform = "mattermost"
            mattermost_url = "https://chat.example.com"
            max_sessions = 3
            "#,
        )
        .unwrap();
        let merged =
            Config::from_base_config_with_overrides(cfg, ConfigOverrides::default()).unwrap();
        assert_eq!(merged.max_sessions, 3);
        assert_eq!(merged.agent_cmd, vec!["claude".to_string()]);
        assert_eq!(merged.idle_warn, Duration::from_secs(30 * 60));
        assert_eq!(merged.permission_mode, PermissionMode::Interactive);
    }

    #[test]
    fn overrides_win_over_file_values() {
        let cfg: ConfigToml = toml::from_str(r#"platform = "slack""#).unwrap();
        let overrides = ConfigOverrides {
            platform: Some(PlatformKind::Mattermost),
            max_sessions: Some(1),
            ..Default::default()
        };
        let merged = Config::from_base_config_with_overrides(cfg, overrides).unwrap();
        assert_eq!(merged.platform, PlatformKind::Mattermost);
        assert_eq!(merged.max_sessions, 1);
    }

    #[test]
    fn missing_platform_is_a_config_error() {
        let err = Config::from_base_config_with_overrides(
            ConfigToml::default(),
            ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RelayErr::Config(_)));
    }
}
