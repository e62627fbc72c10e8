use std::net::SocketAddr;

use anyhow::Context;
use chronowire_core::ChronowireConfig;
use chronowire_gateway::Chronowire;
use clap::Parser;
use tracing::{info, warn};

/// Chronowire gateway: scheduled jobs and realtime rooms over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "chronowire-gateway", version, about)]
struct Cli {
    /// Config file (defaults to $CHRONOWIRE_CONFIG, then ~/.chronowire/chronowire.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// Override `gateway.bind`.
    #[arg(long)]
    bind: Option<String>,

    /// Override `gateway.port`.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chronowire_gateway=info,chronowire_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CHRONOWIRE_CONFIG env > ~/.chronowire/chronowire.toml
    let config_path = cli.config.or_else(|| std::env::var("CHRONOWIRE_CONFIG").ok());
    let mut config = ChronowireConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({e}), using defaults");
        ChronowireConfig::default()
    });
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .context("invalid gateway bind address")?;

    let chronowire = Chronowire::new(config).context("failed to open job store")?;
    let recovered = chronowire.start().await?;
    if recovered > 0 {
        info!(recovered, "recovered jobs from previous run");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let server = {
        let cw = chronowire.clone();
        tokio::spawn(async move { cw.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    chronowire.shutdown().await;
    server.await??;
    Ok(())
}
