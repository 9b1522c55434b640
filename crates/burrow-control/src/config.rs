//! Relay core configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Liveness policy for one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPolicy {
    /// Interval the agent is expected to heartbeat at
    pub interval: Duration,
    /// Heartbeats that may be missed before the agent is released
    pub max_missed: u32,
}

impl HeartbeatPolicy {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed: max_missed.max(1),
        }
    }

    /// Silence longer than this releases the agent
    pub fn threshold(&self) -> Duration {
        self.interval * self.max_missed.max(1)
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

/// Tunables for the relay core
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Domain public subdomains hang off (e.g. `relay.example.com`)
    pub base_domain: String,
    /// Default heartbeat policy for agents without an override
    pub heartbeat: HeartbeatPolicy,
    /// Period of the liveness sweep
    pub sweep_interval: Duration,
    /// How long a start directive may wait for the agent's acknowledgment
    pub ack_timeout: Duration,
    /// Inactivity deadline of a relayed exchange
    pub exchange_timeout: Duration,
    /// Bounded outbound queue per agent connection
    pub outbound_queue_capacity: usize,
    /// Frames buffered per exchange before it is aborted
    pub exchange_buffer: usize,
    pub max_subdomain_attempts: usize,
    pub event_log_capacity: usize,
    /// Request bodies are split into `Data` frames of at most this size
    pub max_chunk_size: usize,
    /// Time allowed between accepting a control connection and its `Hello`
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            heartbeat: HeartbeatPolicy::default(),
            sweep_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            exchange_timeout: Duration::from_secs(30),
            outbound_queue_capacity: 256,
            exchange_buffer: 64,
            max_subdomain_attempts: 20,
            event_log_capacity: 100,
            max_chunk_size: 16 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, max_missed: u32) -> Self {
        self.heartbeat = HeartbeatPolicy::new(interval, max_missed);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_exchange_buffer(mut self, frames: usize) -> Self {
        self.exchange_buffer = frames.max(1);
        self
    }

    pub fn with_max_subdomain_attempts(mut self, attempts: usize) -> Self {
        self.max_subdomain_attempts = attempts;
        self
    }

    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size.max(1);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sweep period actually used: never longer than the heartbeat interval
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.min(self.heartbeat.interval)
    }
}
