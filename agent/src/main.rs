//! # bunnel
//!
//! Reverse HTTP tunnel agent. Dials out to a `bunnel-server` control
//! channel and forwards whatever it's asked to fetch to a local service.
//!
//! ## Modules
//!
//! - [`config`] — CLI surface
//! - [`executor`] — the connect/serve/reconnect loop
//! - [`local`] — forwarding requests to the local service

mod config;
mod executor;
mod local;

use clap::Parser;
use config::Cli;
use executor::AgentExecutor;
use tracing::info;

fn init_tracing() {
    let filter = std::env::var("BUNNEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider was already installed"))?;

    let cli = Cli::parse();

    info!(tunnel = %cli.tunnel, local = %cli.local, "starting bunnel agent");
    let executor = AgentExecutor::new(cli.tunnel, cli.local, cli.self_signed);

    let info = executor.connect().await?;
    info!(
        subdomain = %info.subdomain,
        tunnel_url = %info.tunnel_url,
        "tunnel established, forwarding requests to local service"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    executor.disconnect();

    Ok(())
}
