//! Relay configuration file and provisioning

use anyhow::{Context, Result};
use burrow_control::{RelayConfig, RelayCore};
use burrow_proto::{LocalTarget, TunnelKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,

    /// Agents (and their tunnels) created at startup
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_addr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_missed_heartbeats: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_queue_capacity: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subdomain_attempts: Option<usize>,
}

impl RelaySection {
    /// Overlay the values set in the file on `config`
    pub fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(domain) = &self.base_domain {
            config.base_domain = domain.clone();
        }
        if self.heartbeat_interval_secs.is_some() || self.max_missed_heartbeats.is_some() {
            let interval = self
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(config.heartbeat.interval);
            let max_missed = self
                .max_missed_heartbeats
                .unwrap_or(config.heartbeat.max_missed);
            config = config.with_heartbeat(interval, max_missed);
        }
        if let Some(secs) = self.ack_timeout_secs {
            config = config.with_ack_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.exchange_timeout_secs {
            config = config.with_exchange_timeout(Duration::from_secs(secs));
        }
        if let Some(capacity) = self.outbound_queue_capacity {
            config = config.with_outbound_queue_capacity(capacity);
        }
        if let Some(attempts) = self.max_subdomain_attempts {
            config = config.with_max_subdomain_attempts(attempts);
        }
        config
    }
}

/// An agent provisioned from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSpec {
    pub owner: String,
    pub name: String,

    /// Environment variable holding the agent token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Token in clear (prefer token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    /// Address on the agent's network, `host:port`
    pub target: String,
}

fn default_kind() -> String {
    "http".to_string()
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

impl AgentSpec {
    fn resolve_token(&self) -> Result<Option<String>> {
        if let Some(env_var) = &self.token_env {
            let token = std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?;
            return Ok(Some(token));
        }
        Ok(self.token.clone())
    }
}

/// Create the agents and tunnels listed in the config file.
///
/// Agents without a configured token get a generated one, which is logged
/// so the operator can hand it to the agent.
pub async fn provision(core: &RelayCore, agents: &[AgentSpec]) -> Result<usize> {
    let mut tunnels = 0;
    for spec in agents {
        let record = match spec.resolve_token()? {
            Some(token) => core
                .create_agent_with_token(&spec.owner, &spec.name, &token)
                .await
                .with_context(|| format!("Failed to provision agent '{}'", spec.name))?,
            None => {
                let record = core
                    .create_agent(&spec.owner, &spec.name)
                    .await
                    .with_context(|| format!("Failed to provision agent '{}'", spec.name))?;
                info!(
                    agent_id = %record.id,
                    "Generated token for agent '{}': {}", spec.name, record.token
                );
                record
            }
        };

        for tunnel in &spec.tunnels {
            let kind: TunnelKind = tunnel
                .kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid kind for tunnel '{}'", tunnel.name))?;
            let target = LocalTarget::parse(&tunnel.target)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid target for tunnel '{}'", tunnel.name))?;
            let status = core
                .create_tunnel(&spec.owner, &record.id, &tunnel.name, kind, target)
                .await
                .with_context(|| format!("Failed to provision tunnel '{}'", tunnel.name))?;
            info!(
                agent_id = %record.id,
                tunnel_id = %status.id,
                "Tunnel '{}' published at {}", tunnel.name, status.public_url
            );
            tunnels += 1;
        }
    }
    Ok(tunnels)
}
