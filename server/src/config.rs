//! CLI surface for `bunnel-server`.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bunnel-server", about = "Reverse HTTP tunnel server")]
pub struct Cli {
    /// Port the tunnel listener (TLS, subdomain routing) binds to.
    #[arg(short = 'p', long, default_value_t = 4444)]
    pub port: u16,

    /// Port a plain-HTTP proxy listener binds to, forwarding to the tunnel
    /// listener over loopback. Useful when a TLS-terminating reverse proxy
    /// sits in front of this process.
    #[arg(short = 'x', long, default_value_t = 5555)]
    pub proxy: u16,

    /// TLS certificate (PEM). Must be given together with --key.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM). Must be given together with --cert.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Additional CA certificates to trust (currently unused by the server
    /// itself; reserved for future mutual-TLS support).
    #[arg(long, num_args = 0..)]
    pub ca: Vec<PathBuf>,
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cert.is_some() != self.key.is_some() {
            anyhow::bail!("--cert and --key must both be given, or both omitted");
        }
        Ok(())
    }
}
