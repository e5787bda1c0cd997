// OffMesh Linux: LAN discovery, TCP transport and a console chat over one live session.

mod cli;
mod config;
mod console;
mod discovery;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use offmesh_core::{ConnectionManager, DeviceId, TcpTransport};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::discovery::Discovery;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    // Stdout belongs to the console.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        cfg.transport_port = port;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli, cfg))
}

async fn run(cli: Cli, cfg: config::Config) -> anyhow::Result<()> {
    let bind = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), cfg.transport_port);
    let mut transport = TcpTransport::new(bind);

    let mut discovery = None;
    let mut discovery_task = None;
    if !cli.no_discovery {
        let d = Arc::new(Discovery::new(
            DeviceId::generate(),
            cfg.device_name.clone(),
            cfg.transport_port,
        ));
        match discovery::spawn(d.clone(), cfg.discovery_port) {
            Ok(task) => {
                transport = transport.with_discovery(d.clone());
                discovery = Some(d);
                discovery_task = Some(task);
            }
            Err(e) => warn!(port = cfg.discovery_port, error = %e, "discovery unavailable"),
        }
    }

    let manager = ConnectionManager::with_config(transport, cfg.manager_config());
    let (tx, rx) = mpsc::unbounded_channel();
    manager.set_consumer(Some(tx));
    info!(
        device = %cfg.device_name,
        port = cfg.transport_port,
        version = env!("CARGO_PKG_VERSION"),
        "offmesh started"
    );

    if cli.listen {
        manager.start();
    }
    if let Some(peer) = cli.connect {
        manager.connect(peer);
    }

    let result = console::run(&manager, discovery.as_deref(), rx, shutdown_signal()).await;

    manager.stop();
    if let Some(task) = discovery_task {
        task.shutdown().await;
    }
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
