use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlatformArg {
    Mattermost,
    Slack,
}

/// Bridge a coding agent into chat threads.
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Cli {
    /// Path to the config file (default: ~/.coderelay/config.toml).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Chat platform to connect to; overrides the config file.
    #[arg(long, value_enum)]
    pub platform: Option<PlatformArg>,

    /// Agent command, e.g. `--agent-cmd claude`; may repeat for extra argv
    /// tokens.
    #[arg(long = "agent-cmd", value_name = "TOKEN")]
    pub agent_cmd: Vec<String>,

    /// Maximum number of concurrently hosted sessions.
    #[arg(long, value_name = "N")]
    pub max_sessions: Option<usize>,

    /// Where session records live.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
