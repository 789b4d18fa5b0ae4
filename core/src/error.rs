use std::io;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, RelayErr>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayErr {
    /// The platform layer gave up after its bounded retries, or reported an
    /// unrecoverable post-level condition the caller did not absorb.
    #[error(transparent)]
    Platform(#[from] coderelay_platform::PlatformError),

    /// The fleet is full; new sessions are rejected.
    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("no session for thread: {0}")]
    SessionNotFound(String),

    /// The supervisor is draining; no new work is admitted.
    #[error("shutting down")]
    ShuttingDown,

    /// The agent child could not be spawned (missing binary, bad cwd, or
    /// stdio pipes not captured).
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    /// The session's work loop is gone; the handle is stale.
    #[error("session loop died unexpectedly")]
    SessionLoopDied,

    /// A resume attempt failed permanently (exhausted retries or the agent
    /// reported an unrecoverable state).
    #[error("resume failed permanently for session {0}")]
    ResumeFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
