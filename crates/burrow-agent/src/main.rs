//! Burrow Agent - connects to a burrow relay and serves its tunnels

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow agent - exposes local services through a burrow relay
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(version)]
#[command(long_about = r#"
Burrow Agent dials out to a relay server and forwards the public requests
routed to its tunnels to the local targets the relay assigns.

EXAMPLES:
  # Start with flags
  burrow-agent --relay relay.example.com:7000 --auth-token $TOKEN

  # Start from a config file
  burrow-agent --config agent.yaml --log-level debug

ENVIRONMENT VARIABLES:
  BURROW_RELAY          Relay control address
  BURROW_AUTH_TOKEN     Agent token issued by the relay
"#)]
struct Args {
    /// Relay control address (e.g., relay.example.com:7000)
    #[arg(long, env = "BURROW_RELAY")]
    relay: Option<String>,

    /// Agent token issued by the relay
    #[arg(long, env = "BURROW_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Failed connection attempts in a row before giving up (0 = retry forever)
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Seconds to wait between connection attempts
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    relay: RelayEndpoint,

    #[serde(default)]
    agent: AgentSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayEndpoint {
    /// Relay control address
    address: String,

    /// Environment variable holding the token
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token_env: Option<String>,

    /// Token in clear (prefer auth_token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_reconnect_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    reconnect_delay_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    heartbeat_interval_secs: Option<u64>,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args with the config file; CLI args win
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let mut config = AgentConfig::default();
    let mut relay_addr = String::new();
    let mut auth_token = String::new();

    if let Some(path) = &args.config {
        info!("Loading configuration from: {}", path.display());
        let file = load_config_file(path)?;

        relay_addr = file.relay.address;
        auth_token = if let Some(env_var) = &file.relay.auth_token_env {
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?
        } else {
            file.relay.auth_token.unwrap_or_default()
        };

        if let Some(attempts) = file.agent.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(secs) = file.agent.reconnect_delay_secs {
            config.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = file.agent.heartbeat_interval_secs {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
    }

    config.relay_addr = args.relay.unwrap_or(relay_addr);
    config.auth_token = args.auth_token.unwrap_or(auth_token);
    if let Some(attempts) = args.max_reconnect_attempts {
        config.max_reconnect_attempts = attempts;
    }
    if let Some(secs) = args.reconnect_delay {
        config.reconnect_delay = Duration::from_secs(secs);
    }

    if config.relay_addr.is_empty() {
        anyhow::bail!("Relay address is required (use --relay or config file)");
    }
    if config.auth_token.is_empty() {
        anyhow::bail!(
            "Auth token is required (use --auth-token, environment variable, or config file)"
        );
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    info!("Burrow agent starting...");

    let config = build_agent_config(args).context("Failed to build agent configuration")?;
    info!("Relay: {}", config.relay_addr);
    info!(
        "Reconnect: {} attempts, {}s delay",
        config.max_reconnect_attempts,
        config.reconnect_delay.as_secs()
    );

    let agent = Agent::new(config).context("Failed to create agent")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                shutdown.cancel();
            }
        });
    }

    if let Err(e) = agent.run(shutdown).await {
        error!("Agent stopped: {}", e);
        return Err(e.into());
    }

    info!("Agent stopped");
    Ok(())
}
