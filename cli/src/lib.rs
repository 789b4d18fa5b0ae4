mod cli;

use std::sync::Arc;

use anyhow::Context;
use anyhow::anyhow;
pub use cli::Cli;
use cli::PlatformArg;
use coderelay_core::Config;
use coderelay_core::ConfigOverrides;
use coderelay_core::SessionSupervisor;
use coderelay_core::config::PlatformKind;
use coderelay_platform::ChatClient;
use coderelay_platform::ChatEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHAT_EVENT_BUFFER: usize = 256;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let overrides = ConfigOverrides {
        platform: cli.platform.map(|p| match p {
            PlatformArg::Mattermost => PlatformKind::Mattermost,
            PlatformArg::Slack => PlatformKind::Slack,
        }),
        agent_cmd: (!cli.agent_cmd.is_empty()).then_some(cli.agent_cmd),
        max_sessions: cli.max_sessions,
        data_dir: cli.data_dir,
    };
    let config = Arc::new(Config::load(cli.config.as_ref(), overrides)?);

    let (chat_tx, chat_rx) = mpsc::channel::<ChatEvent>(CHAT_EVENT_BUFFER);
    let (client, platform_id): (Arc<dyn ChatClient>, &str) = match config.platform {
        PlatformKind::Mattermost => {
            let url = config
                .mattermost_url
                .clone()
                .ok_or_else(|| anyhow!("mattermost_url is not configured"))?;
            let token = config
                .mattermost_token
                .clone()
                .ok_or_else(|| anyhow!("mattermost_token is not configured"))?;
            let channel = config
                .channel
                .clone()
                .context("`channel` must name the home channel in the config")?;
            let client = coderelay_mattermost::MattermostClient::connect(
                &url,
                &token,
                &channel,
                config.allowed_users.clone(),
            )
            .await?;
            tokio::spawn(coderelay_mattermost::run_event_stream(
                url,
                token,
                chat_tx.clone(),
            ));
            (Arc::new(client), "mattermost")
        }
        PlatformKind::Slack => {
            let bot_token = config
                .slack_bot_token
                .clone()
                .ok_or_else(|| anyhow!("slack_bot_token is not configured"))?;
            let app_token = config
                .slack_app_token
                .clone()
                .ok_or_else(|| anyhow!("slack_app_token is not configured"))?;
            let channel = config
                .channel
                .clone()
                .context("`channel` must name the home channel in the config")?;
            let client = coderelay_slack::SlackClient::connect(
                &bot_token,
                &app_token,
                &channel,
                config.allowed_users.clone(),
            )
            .await?;
            tokio::spawn(coderelay_slack::run_event_stream(app_token, chat_tx.clone()));
            (Arc::new(client), "slack")
        }
    };
    drop(chat_tx);

    let (supervisor, notice_rx) = SessionSupervisor::new(
        config.clone(),
        client,
        platform_id.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );

    supervisor.resume_all().await;
    info!(
        "coderelay running on {platform_id} with {} resumed sessions",
        supervisor.session_count().await
    );

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            ctrl_c_token.cancel();
        }
    });

    supervisor.run(chat_rx, notice_rx, shutdown).await;
    Ok(())
}
