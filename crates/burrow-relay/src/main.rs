//! Burrow relay server
//!
//! Accepts agent control connections on one port and public HTTP requests on
//! another, routing each request to the agent serving its subdomain.

mod config;
mod public;

use anyhow::{Context, Result};
use burrow_control::{serve_agent_connection, RelayConfig, RelayCore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Burrow relay - routes public requests to agents behind NAT
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Run a burrow relay server", long_about = None)]
#[command(version)]
struct Cli {
    /// Agent control listener bind address [default: 0.0.0.0:7000]
    #[arg(long, env = "BURROW_CONTROL_ADDR")]
    control_addr: Option<String>,

    /// Public HTTP listener bind address [default: 0.0.0.0:8080]
    #[arg(long, env = "BURROW_HTTP_ADDR")]
    http_addr: Option<String>,

    /// Public domain; tunnels are served as {subdomain}.{domain} [default: localhost]
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Configuration file (YAML) with relay settings and provisioned agents
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Expected agent heartbeat interval in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Heartbeats an agent may miss before it is marked offline
    #[arg(long)]
    max_missed_heartbeats: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Accept agent control connections until `shutdown` fires
async fn serve_control(listener: TcpListener, core: Arc<RelayCore>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let core = core.clone();
                tokio::spawn(async move {
                    debug!("Agent connection from {}", peer);
                    if let Err(e) = serve_agent_connection(core, stream, peer.to_string()).await {
                        warn!("Agent connection from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept agent connection: {}", e);
            }
        }
    }
    info!("Control listener stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting burrow relay");

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_config_file(path)?
        }
        None => config::ConfigFile::default(),
    };

    // CLI flags win over the file
    let mut relay_config = file.relay.apply(RelayConfig::default());
    if let Some(domain) = cli.domain {
        relay_config.base_domain = domain;
    }
    if cli.heartbeat_interval.is_some() || cli.max_missed_heartbeats.is_some() {
        let interval = cli
            .heartbeat_interval
            .map(Duration::from_secs)
            .unwrap_or(relay_config.heartbeat.interval);
        let max_missed = cli
            .max_missed_heartbeats
            .unwrap_or(relay_config.heartbeat.max_missed);
        relay_config = relay_config.with_heartbeat(interval, max_missed);
    }

    let control_addr = cli
        .control_addr
        .or(file.relay.control_addr.clone())
        .unwrap_or_else(|| "0.0.0.0:7000".to_string());
    let http_addr = cli
        .http_addr
        .or(file.relay.http_addr.clone())
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());

    info!("Control endpoint: {}", control_addr);
    info!("HTTP endpoint: {}", http_addr);
    info!("Public domain: {}", relay_config.base_domain);
    info!("Subdomains will be: {{name}}.{}", relay_config.base_domain);
    info!(
        "Heartbeat: every {}s, offline after {} missed",
        relay_config.heartbeat.interval.as_secs(),
        relay_config.heartbeat.max_missed
    );

    let core = Arc::new(RelayCore::new(relay_config));

    if !file.agents.is_empty() {
        let tunnels = config::provision(&core, &file.agents).await?;
        info!(
            "Provisioned {} agent(s) and {} tunnel(s)",
            file.agents.len(),
            tunnels
        );
    }

    let control_listener = TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", control_addr))?;
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

    let shutdown = CancellationToken::new();
    let monitor = core.spawn_heartbeat_monitor(shutdown.clone());
    let control = tokio::spawn(serve_control(
        control_listener,
        core.clone(),
        shutdown.clone(),
    ));
    let http = tokio::spawn(public::serve(http_listener, core.clone(), shutdown.clone()));

    info!("Relay is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down relay...");
    shutdown.cancel();

    for agent in core.active_agents() {
        core.release(&agent.id);
    }
    let _ = tokio::join!(monitor, control, http);

    info!("Relay stopped");
    Ok(())
}
