//! webirc-bridge: reverse proxy terminating IRCv3-over-WebSocket clients and
//! forwarding them to a conventional line-oriented ircd.

mod cli;
mod config;
mod server;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::cli::Cli;
use crate::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let gateway_config =
        config::load(&cli.config).context("config file did not load successfully")?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&gateway_config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        gateway = %gateway_config.gateway_name,
        upstreams = gateway_config.upstreams.len(),
        "webirc-bridge starting"
    );

    let server = Server::new(cli.config, gateway_config)
        .await
        .context("could not start server")?;
    server.run().await
}
