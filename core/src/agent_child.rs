//! The agent subprocess.
//!
//! The agent is launched with stdio pipes and speaks line-delimited JSON:
//! events out on stdout, user input in on stdin. A reader task pumps parsed
//! events into the session's work queue; a small supervisor task owns the
//! `Child` so the session can kill it without juggling `&mut` access.

use std::path::Path;
use std::process::Stdio;

use coderelay_protocol::agent::AgentEvent;
use coderelay_protocol::agent::AgentInput;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::config::PermissionMode;
use crate::error::RelayErr;
use crate::error::Result;

#[derive(Debug)]
pub enum AgentChildMsg {
    Event(Box<AgentEvent>),
    Exited { code: Option<i32> },
}

pub struct AgentLaunch<'a> {
    pub command: &'a [String],
    pub cwd: &'a Path,
    /// The agent-side session identifier: passed as `--session-id` on a
    /// fresh launch, `--resume` when continuing an earlier one.
    pub agent_session_id: Uuid,
    pub resume: bool,
    pub permission_mode: PermissionMode,
}

pub struct AgentHandle {
    stdin: ChildStdin,
    kill_tx: Option<oneshot::Sender<()>>,
    pub pid: Option<u32>,
}

impl AgentHandle {
    pub async fn send_user_text(&mut self, text: &str) -> Result<()> {
        let line = AgentInput::user_text(text).to_line()?;
        self.send_raw_line(&line).await
    }

    pub async fn send_raw_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Ask the supervisor task to kill the child. Idempotent.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawn the agent and wire its stdio into `events_tx`. Exactly one
/// `Exited` message is delivered per spawn.
pub fn spawn_agent(
    launch: AgentLaunch<'_>,
    events_tx: mpsc::UnboundedSender<AgentChildMsg>,
) -> Result<AgentHandle> {
    let Some((program, base_args)) = launch.command.split_first() else {
        return Err(RelayErr::Spawn("empty agent command".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(base_args)
        .arg("-p")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--input-format")
        .arg("stream-json")
        .arg("--verbose");
    match launch.permission_mode {
        PermissionMode::Interactive => {}
        PermissionMode::Auto => {
            cmd.arg("--dangerously-skip-permissions");
        }
    }
    if launch.resume {
        cmd.arg("--resume").arg(launch.agent_session_id.to_string());
    } else {
        cmd.arg("--session-id").arg(launch.agent_session_id.to_string());
    }
    cmd.current_dir(launch.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RelayErr::Spawn(format!("{program}: {e}")))?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RelayErr::Spawn("agent stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RelayErr::Spawn("agent stdout not captured".to_string()))?;

    // Reader: one parsed event per stdout line.
    let reader_tx = events_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match AgentEvent::parse_line(&line) {
                    Ok(Some(event)) => {
                        if reader_tx.send(AgentChildMsg::Event(Box::new(event))).is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!("skipping unrecognized agent event"),
                    Err(e) => warn!("unparseable agent output line: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading agent stdout: {e}");
                    break;
                }
            }
        }
    });

    // Supervisor: owns the child, reports the exit exactly once.
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => status.ok().and_then(|s| s.code()),
            _ = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!("failed to kill agent child: {e}");
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        };
        debug!("agent child exited with code {code:?}");
        let _ = events_tx.send(AgentChildMsg::Exited { code });
    });

    Ok(AgentHandle {
        stdin,
        kill_tx: Some(kill_tx),
        pid,
    })
}
