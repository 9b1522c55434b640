//! Protocol message types

use crate::frame::RelayFrame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every message carried on an agent control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    // Handshake
    /// First message an agent sends after dialing in
    Hello {
        auth_token: String,
        metadata: AgentMetadata,
    },
    /// Relay admitted the agent
    Welcome {
        agent_id: String,
        heartbeat_interval_ms: u64,
        max_missed: u32,
    },
    /// Relay refused the agent (bad token, deactivated, protocol violation)
    Rejected {
        reason: String,
    },

    // Liveness
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    /// Relay changed the agent's heartbeat policy; replaces the `Welcome` values
    ConfigUpdate {
        heartbeat_interval_ms: u64,
        max_missed: u32,
    },

    // Tunnel directives (relay -> agent) and their acknowledgments.
    // `generation` ties an answer to the directive it answers.
    StartTunnel {
        tunnel_id: String,
        generation: u64,
        subdomain: String,
        kind: TunnelKind,
        local_target: LocalTarget,
    },
    StopTunnel {
        tunnel_id: String,
    },
    TunnelAck {
        tunnel_id: String,
        generation: u64,
    },
    TunnelNack {
        tunnel_id: String,
        generation: u64,
        reason: String,
    },

    /// Multiplexed exchange traffic
    Frame(RelayFrame),

    /// Clean close, sent by either side
    Disconnect {
        reason: String,
    },
}

impl RelayMessage {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Hello { .. } => "hello",
            RelayMessage::Welcome { .. } => "welcome",
            RelayMessage::Rejected { .. } => "rejected",
            RelayMessage::Ping { .. } => "ping",
            RelayMessage::Pong { .. } => "pong",
            RelayMessage::ConfigUpdate { .. } => "config_update",
            RelayMessage::StartTunnel { .. } => "start_tunnel",
            RelayMessage::StopTunnel { .. } => "stop_tunnel",
            RelayMessage::TunnelAck { .. } => "tunnel_ack",
            RelayMessage::TunnelNack { .. } => "tunnel_nack",
            RelayMessage::Frame(_) => "frame",
            RelayMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// Kind of traffic a tunnel carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Http,
    Https,
    Tcp,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Http => "http",
            TunnelKind::Https => "https",
            TunnelKind::Tcp => "tcp",
        }
    }

    /// URL scheme used when building the public address of a tunnel
    pub fn scheme(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TunnelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelKind::Http),
            "https" => Ok(TunnelKind::Https),
            "tcp" => Ok(TunnelKind::Tcp),
            other => Err(format!("unknown tunnel kind '{}'", other)),
        }
    }
}

/// Address an agent forwards to on its own network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
}

impl LocalTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string. IPv6 hosts must be bracketed.
    pub fn parse(address: &str) -> Result<Self, String> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid target '{}': expected host:port", address))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("invalid target '{}': empty host", address));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid target '{}': bad port", address))?;
        if port == 0 {
            return Err(format!("invalid target '{}': port must be non-zero", address));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Agent metadata reported at registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String, // e.g., "linux", "macos", "windows"
    pub version: String,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
