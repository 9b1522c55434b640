//! Heartbeat monitor
//!
//! Periodically releases online agents that have been silent longer than
//! `interval × max_missed` of their heartbeat policy. Any inbound message
//! counts as a heartbeat. Reconnection is left to the agent.
//!
//! The sweep period never exceeds the shortest heartbeat interval of an
//! online agent, so per-agent overrides tighter than the default are still
//! checked in time.

use crate::relay_core::RelayCore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub struct HeartbeatMonitor {
    core: Arc<RelayCore>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(core: Arc<RelayCore>) -> Self {
        let interval = core.config().effective_sweep_interval();
        Self { core, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay before the next sweep
    pub fn next_period(&self) -> Duration {
        let period = match self.core.registry().shortest_policy_interval() {
            Some(shortest) => self.interval.min(shortest),
            None => self.interval,
        };
        period.max(MIN_SWEEP_INTERVAL)
    }

    /// One pass over the online agents; returns how many were released
    pub fn sweep(&self) -> usize {
        let stale = self.core.registry().stale_agents();
        if stale.is_empty() {
            return 0;
        }

        let mut released = 0;
        for (agent_id, connection_id) in stale {
            info!(agent_id = %agent_id, connection_id, "Agent missed heartbeats, releasing");
            if self.core.expire(&agent_id, connection_id) {
                released += 1;
            }
        }
        released
    }

    /// Sweep until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(interval_ms = self.interval.as_millis() as u64, "Heartbeat monitor started");
        let mut policies = self.core.registry().watch_policies();

        loop {
            let period = self.next_period();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Heartbeat monitor stopped");
                    break;
                }
                Ok(()) = policies.changed() => {
                    debug!("Heartbeat policies changed, rescheduling sweep");
                }
                _ = tokio::time::sleep(period) => {
                    let released = self.sweep();
                    if released > 0 {
                        debug!(released, "Heartbeat sweep finished");
                    }
                }
            }
        }
    }
}
