//! Agent and tunnel records as seen by the relay core

use crate::config::HeartbeatPolicy;
use burrow_proto::{AgentMetadata, LocalTarget, TunnelKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

pub type AgentId = String;
pub type TunnelId = String;
pub type OwnerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Offline,
    Connecting,
    Online,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Offline => "offline",
            AgentState::Connecting => "connecting",
            AgentState::Online => "online",
            AgentState::Error => "error",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Requested,
    Connecting,
    Active,
    Inactive,
    Error,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Requested => "requested",
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Inactive => "inactive",
            TunnelState::Error => "error",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned once on agent creation; the token is not retrievable afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub owner_id: OwnerId,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub total_connections: u64,
    pub bytes_transferred: u64,
}

/// Dashboard snapshot of an agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub id: AgentId,
    pub owner_id: OwnerId,
    pub name: String,
    pub state: AgentState,
    pub active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub peer: Option<String>,
    pub metadata: Option<AgentMetadata>,
    pub heartbeat: HeartbeatPolicy,
    pub stats: AgentStats,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStats {
    pub exchanges: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_exchange_at: Option<DateTime<Utc>>,
}

/// Dashboard snapshot of a tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub id: TunnelId,
    pub owner_id: OwnerId,
    pub agent_id: AgentId,
    pub name: String,
    pub subdomain: String,
    pub kind: TunnelKind,
    pub local_target: LocalTarget,
    pub public_url: String,
    pub state: TunnelState,
    pub error: Option<String>,
    pub explicitly_stopped: bool,
    pub stats: TunnelStats,
    pub created_at: DateTime<Utc>,
}

/// Status changes pushed to dashboard subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    AgentConnected {
        agent_id: AgentId,
        owner_id: OwnerId,
    },
    AgentDisconnected {
        agent_id: AgentId,
        owner_id: OwnerId,
        reason: String,
    },
    AgentDeleted {
        agent_id: AgentId,
        owner_id: OwnerId,
    },
    TunnelStateChanged {
        tunnel_id: TunnelId,
        owner_id: OwnerId,
        state: TunnelState,
        error: Option<String>,
    },
    TunnelDeleted {
        tunnel_id: TunnelId,
        owner_id: OwnerId,
    },
}

/// `{scheme}://{subdomain}.{base_domain}`
pub fn public_url(kind: TunnelKind, subdomain: &str, base_domain: &str) -> String {
    format!("{}://{}.{}", kind.scheme(), subdomain, base_domain)
}
