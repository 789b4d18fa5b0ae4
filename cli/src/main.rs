use clap::Parser;
use coderelay_cli::Cli;
use coderelay_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_main(cli).await
}
