//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Point-to-point chat over the local network.
#[derive(Parser, Debug, Clone)]
#[command(name = "offmesh-linux")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.config/offmesh/config.toml, then /etc/offmesh/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Wait for an inbound connection at startup.
    #[arg(long)]
    pub listen: bool,

    /// Dial this peer (host:port) at startup.
    #[arg(long, conflicts_with = "listen")]
    pub connect: Option<String>,

    /// Session TCP port; overrides the config file.
    #[arg(long)]
    pub port: Option<u16>,

    /// Do not run LAN discovery.
    #[arg(long)]
    pub no_discovery: bool,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
