//! `!command` parsing for chat messages.
//!
//! A command is a leading `!` token at the start of the message. Unknown
//! `!words` are not commands and pass through as plain text; known commands
//! with invalid arguments are reported back to the user.

use crate::config::PermissionMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeAction {
    List,
    Switch(String),
    Create(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Now,
    Defer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stop,
    Escape,
    Approve,
    Help,
    Kill,
    Cd { path: String },
    Invite { user: String },
    Kick { user: String },
    Permissions { mode: PermissionMode },
    Update { action: Option<UpdateAction> },
    Worktree { action: WorktreeAction },
    /// Forwarded to the agent verbatim as a slash command.
    Passthrough { name: String },
}

impl Command {
    /// Commands the agent itself may issue. Everything else is user-only
    /// and must be ignored when agent-emitted.
    pub fn agent_allowed(&self) -> bool {
        matches!(
            self,
            Command::Cd { .. }
                | Command::Worktree {
                    action: WorktreeAction::List
                }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub command: &'static str,
    pub detail: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{}: {}", self.command, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: Command,
    /// The message with the matched command text removed verbatim.
    pub rest: String,
}

fn strip_at(user: &str) -> String {
    user.strip_prefix('@').unwrap_or(user).to_string()
}

/// Parse a leading command. `None`: not a command at all (plain text).
/// `Some(Err(_))`: a known command with invalid arguments.
pub fn parse_command(text: &str) -> Option<Result<ParsedCommand, CommandError>> {
    let trimmed_start = text.trim_start();
    let leading_ws_len = text.len() - trimmed_start.len();
    let token = trimmed_start.split_whitespace().next()?;
    let name = token.strip_prefix('!')?;
    if name.is_empty() {
        return None;
    }
    let name = name.to_ascii_lowercase();

    // Tokens after the command, confined to the first line.
    let first_line = trimmed_start.lines().next().unwrap_or(trimmed_start);
    let after_token = &first_line[token.len()..];
    let mut args = after_token.split_whitespace();

    // Tracks how much of the first line the command consumed, so the match
    // can be removed verbatim.
    let mut consumed = token.len();
    let mut take_arg = |args: &mut dyn Iterator<Item = &str>| -> Option<String> {
        let arg = args.next()?;
        let search_from = consumed - token.len();
        let rel = after_token[search_from..].find(arg).unwrap_or(0);
        consumed = token.len() + search_from + rel + arg.len();
        Some(arg.to_string())
    };

    let command = match name.as_str() {
        "stop" | "cancel" => Command::Stop,
        "escape" | "interrupt" => Command::Escape,
        "approve" | "yes" => Command::Approve,
        "help" => Command::Help,
        "kill" => Command::Kill,
        "cd" => match take_arg(&mut args) {
            Some(path) => Command::Cd { path },
            None => {
                return Some(Err(CommandError {
                    command: "cd",
                    detail: "a path is required".to_string(),
                }));
            }
        },
        "invite" => match take_arg(&mut args) {
            Some(user) => Command::Invite {
                user: strip_at(&user),
            },
            None => {
                return Some(Err(CommandError {
                    command: "invite",
                    detail: "a user is required".to_string(),
                }));
            }
        },
        "kick" => match take_arg(&mut args) {
            Some(user) => Command::Kick {
                user: strip_at(&user),
            },
            None => {
                return Some(Err(CommandError {
                    command: "kick",
                    detail: "a user is required".to_string(),
                }));
            }
        },
        "permissions" | "permission" => match take_arg(&mut args).as_deref() {
            Some("interactive") => Command::Permissions {
                mode: PermissionMode::Interactive,
            },
            Some("auto") => Command::Permissions {
                mode: PermissionMode::Auto,
            },
            _ => {
                return Some(Err(CommandError {
                    command: "permissions",
                    detail: "expected `interactive` or `auto`".to_string(),
                }));
            }
        },
        "update" => match take_arg(&mut args).as_deref() {
            Some("now") => Command::Update {
                action: Some(UpdateAction::Now),
            },
            Some("defer") => Command::Update {
                action: Some(UpdateAction::Defer),
            },
            Some(other) => {
                return Some(Err(CommandError {
                    command: "update",
                    detail: format!("unknown argument `{other}`"),
                }));
            }
            None => Command::Update { action: None },
        },
        "worktree" => match take_arg(&mut args).as_deref() {
            Some("list") => Command::Worktree {
                action: WorktreeAction::List,
            },
            Some("switch") => match take_arg(&mut args) {
                Some(branch) => Command::Worktree {
                    action: WorktreeAction::Switch(branch),
                },
                None => {
                    return Some(Err(CommandError {
                        command: "worktree",
                        detail: "switch requires a branch name".to_string(),
                    }));
                }
            },
            Some(name) => Command::Worktree {
                action: WorktreeAction::Create(name.to_string()),
            },
            None => Command::Worktree {
                action: WorktreeAction::List,
            },
        },
        "context" | "cost" | "compact" => Command::Passthrough { name },
        _ => return None,
    };

    let mut rest = String::with_capacity(text.len());
    rest.push_str(&text[..leading_ws_len]);
    rest.push_str(&text[leading_ws_len + consumed..]);
    Some(Ok(ParsedCommand { command, rest }))
}
