use anyhow::Result;
use boardwalk::{
    cli::{self, Cli, Commands},
    config::ServerConfig,
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        user_id,
        username,
        timeout_secs,
    }) = cli.command
    {
        Telemetry::init(false)?;
        return cli::run_probe(url, user_id, username, timeout_secs).await;
    }

    let telemetry = Telemetry::init(true)?;
    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        matched_event = ?config.signaling.matched_event,
        idle_timeout_secs = config.signaling.idle_timeout.map(|d| d.as_secs()),
        ice_servers = config.ice.ice_servers.len(),
        "starting boardwalk"
    );

    boardwalk::run(config, telemetry.metrics_handle()).await
}
