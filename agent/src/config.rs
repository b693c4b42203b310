//! CLI surface for `bunnel`.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bunnel", about = "Reverse HTTP tunnel agent")]
pub struct Cli {
    /// Base URL of the local service to forward tunneled requests to,
    /// e.g. `http://127.0.0.1:3000`.
    #[arg(short = 'l', long)]
    pub local: String,

    /// WebSocket URL of the tunnel server's control endpoint,
    /// e.g. `wss://bunnel.example.com:4444`.
    #[arg(short = 't', long)]
    pub tunnel: String,

    /// Accept the tunnel server's certificate without verifying it
    /// against a trust store. Only for servers running a self-signed
    /// certificate during local development.
    #[arg(short = 's', long, default_value_t = false)]
    pub self_signed: bool,
}
