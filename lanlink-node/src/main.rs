// lanlink: LAN peer discovery, reliable messaging and file transfer over UDP broadcast.

mod config;
mod console;
mod discovery;
mod node;
mod transport;

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name announced to other nodes
    name: String,

    /// Config file (default ~/.config/lanlink/config.toml, then /etc/lanlink/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port to bind and broadcast to
    #[arg(short, long)]
    port: Option<u16>,

    /// Broadcast address for heartbeats
    #[arg(short, long)]
    broadcast: Option<IpAddr>,

    /// Directory for received files
    #[arg(short, long)]
    download_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        !args.name.trim().is_empty() && !args.name.contains(char::is_whitespace),
        "node name must be a single non-empty word"
    );

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(addr) = args.broadcast {
        cfg.broadcast_addr = addr;
    }
    if let Some(dir) = args.download_dir {
        cfg.download_dir = dir;
    }
    cfg.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (node, events) = node::Node::start(&args.name, &cfg)
            .with_context(|| format!("binding UDP port {}", cfg.port))?;
        tokio::select! {
            r = console::run(&node, events) => r?,
            r = shutdown_signal() => r?,
        }
        tracing::info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })
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
