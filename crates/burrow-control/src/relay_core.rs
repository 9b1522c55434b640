//! Relay core facade
//!
//! `RelayCore` wires the registry, router, lifecycle controller and
//! multiplexer together and is the single entry point for the management
//! layer (agent/tunnel CRUD, status), the network layer (control connections,
//! public requests) and the heartbeat monitor.
//!
//! Agent admissions and releases cascade into the lifecycle controller here,
//! so neither the registry nor the controller needs to know about the other's
//! callers.

use crate::agent_registry::{Admission, AgentRegistry, Released};
use crate::config::{HeartbeatPolicy, RelayConfig};
use crate::error::{RelayError, RelayResult};
use crate::event_log::{EventLog, LogEntry};
use crate::heartbeat::HeartbeatMonitor;
use crate::lifecycle::TunnelLifecycle;
use crate::link::AgentLink;
use crate::model::{AgentRecord, AgentStatus, CoreEvent, TunnelStatus};
use crate::multiplexer::{ExchangeStream, RelayMultiplexer};
use crate::quota::{QuotaChecker, UnlimitedQuota};
use burrow_proto::{AgentMetadata, LocalTarget, RelayMessage, TunnelKind};
use burrow_router::SubdomainRouter;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct RelayCore {
    config: Arc<RelayConfig>,
    log: Arc<EventLog>,
    registry: Arc<AgentRegistry>,
    router: Arc<SubdomainRouter>,
    lifecycle: Arc<TunnelLifecycle>,
    multiplexer: RelayMultiplexer,
    quota: Arc<dyn QuotaChecker>,
    events: broadcast::Sender<CoreEvent>,
}

impl RelayCore {
    pub fn new(config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let log = Arc::new(EventLog::new(config.event_log_capacity));
        let registry = Arc::new(AgentRegistry::new(config.heartbeat, log.clone()));
        let router = Arc::new(SubdomainRouter::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let lifecycle = Arc::new(TunnelLifecycle::new(
            registry.clone(),
            router.clone(),
            config.clone(),
            log.clone(),
            events.clone(),
        ));
        let multiplexer = RelayMultiplexer::new(
            router.clone(),
            registry.clone(),
            lifecycle.clone(),
            config.clone(),
        );

        info!(base_domain = %config.base_domain, "Relay core initialized");

        Self {
            config,
            log,
            registry,
            router,
            lifecycle,
            multiplexer,
            quota: Arc::new(UnlimitedQuota),
            events,
        }
    }

    /// Install the billing layer's quota hook
    pub fn with_quota_checker(mut self, quota: Arc<dyn QuotaChecker>) -> Self {
        self.quota = quota;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<SubdomainRouter> {
        &self.router
    }

    pub fn lifecycle(&self) -> &Arc<TunnelLifecycle> {
        &self.lifecycle
    }

    pub fn multiplexer(&self) -> &RelayMultiplexer {
        &self.multiplexer
    }

    /// Status changes for dashboards
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    // ---- agents ----

    pub async fn create_agent(&self, owner_id: &str, name: &str) -> RelayResult<AgentRecord> {
        self.check_agent_quota(owner_id).await?;
        self.registry.create_agent(owner_id, name)
    }

    /// Create an agent with a token chosen by the caller
    pub async fn create_agent_with_token(
        &self,
        owner_id: &str,
        name: &str,
        token: &str,
    ) -> RelayResult<AgentRecord> {
        self.check_agent_quota(owner_id).await?;
        self.registry.create_agent_with_token(owner_id, name, token)
    }

    async fn check_agent_quota(&self, owner_id: &str) -> RelayResult<()> {
        if self.quota.can_create_agent(owner_id).await {
            Ok(())
        } else {
            warn!(owner_id = %owner_id, "Agent quota exceeded");
            Err(RelayError::QuotaExceeded(format!(
                "agent limit reached for owner {}",
                owner_id
            )))
        }
    }

    /// Delete an agent and every tunnel bound to it
    pub fn delete_agent(&self, agent_id: &str, owner_id: &str) -> RelayResult<()> {
        if self.registry.owner_of(agent_id)? != owner_id {
            return Err(RelayError::agent_not_found(agent_id));
        }

        // Inactive first: a tunnel created concurrently either lands before
        // the sweep below or is refused
        if let Some(released) = self.registry.retire(agent_id)? {
            self.finish_release(released, "agent deleted");
        }
        let removed = self.lifecycle.delete_for_agent(agent_id);
        if let Some(link) = self.registry.delete_agent(agent_id, owner_id)? {
            link.close("agent deleted");
        }

        info!(agent_id = %agent_id, tunnels = removed, "Agent deleted");
        self.emit(CoreEvent::AgentDeleted {
            agent_id: agent_id.to_string(),
            owner_id: owner_id.to_string(),
        });
        Ok(())
    }

    pub fn regenerate_token(&self, agent_id: &str) -> RelayResult<String> {
        self.registry.regenerate_token(agent_id)
    }

    /// Refuse the agent from now on; a live connection is closed
    pub fn deactivate_agent(&self, agent_id: &str) -> RelayResult<()> {
        if let Some(released) = self.registry.deactivate(agent_id)? {
            self.finish_release(released, "agent deactivated");
        }
        Ok(())
    }

    /// Change an agent's heartbeat policy. A connected agent is told the
    /// new interval right away; the relay enforces it from the next sweep.
    pub fn update_agent_config(&self, agent_id: &str, policy: HeartbeatPolicy) -> RelayResult<()> {
        self.registry.set_policy(agent_id, policy)?;
        if let Ok(link) = self.registry.lookup(agent_id) {
            let update = RelayMessage::ConfigUpdate {
                heartbeat_interval_ms: policy.interval.as_millis() as u64,
                max_missed: policy.max_missed,
            };
            if let Err(e) = link.try_send(update) {
                warn!(agent_id = %agent_id, error = %e, "Could not push heartbeat policy to agent");
            }
        }
        Ok(())
    }

    pub fn get_agent_status(&self, agent_id: &str) -> RelayResult<AgentStatus> {
        self.registry.status(agent_id)
    }

    pub fn list_agents(&self, owner_id: &str) -> Vec<AgentStatus> {
        self.registry.list(owner_id)
    }

    pub fn active_agents(&self) -> Vec<AgentStatus> {
        self.registry.active()
    }

    pub fn agent_logs(&self, agent_id: &str, limit: usize) -> RelayResult<Vec<LogEntry>> {
        self.registry.owner_of(agent_id)?;
        Ok(self.log.recent(agent_id, limit))
    }

    // ---- tunnels ----

    pub async fn create_tunnel(
        &self,
        owner_id: &str,
        agent_id: &str,
        name: &str,
        kind: TunnelKind,
        local_target: LocalTarget,
    ) -> RelayResult<TunnelStatus> {
        if !self.quota.can_create_tunnel(owner_id).await {
            warn!(owner_id = %owner_id, "Tunnel quota exceeded");
            return Err(RelayError::QuotaExceeded(format!(
                "tunnel limit reached for owner {}",
                owner_id
            )));
        }
        self.lifecycle
            .create(owner_id, agent_id, name, kind, local_target)
            .await
    }

    pub async fn start_tunnel(&self, tunnel_id: &str, owner_id: &str) -> RelayResult<TunnelStatus> {
        self.lifecycle.check_owner(tunnel_id, owner_id)?;
        self.lifecycle.start(tunnel_id).await
    }

    pub fn stop_tunnel(&self, tunnel_id: &str, owner_id: &str) -> RelayResult<TunnelStatus> {
        self.lifecycle.check_owner(tunnel_id, owner_id)?;
        self.lifecycle.stop(tunnel_id)
    }

    pub fn delete_tunnel(&self, tunnel_id: &str, owner_id: &str) -> RelayResult<()> {
        self.lifecycle.check_owner(tunnel_id, owner_id)?;
        self.lifecycle.delete(tunnel_id)
    }

    pub fn get_tunnel_status(&self, tunnel_id: &str) -> RelayResult<TunnelStatus> {
        self.lifecycle.status(tunnel_id)
    }

    pub fn list_tunnels(&self, owner_id: &str) -> Vec<TunnelStatus> {
        self.lifecycle.list(owner_id)
    }

    pub fn tunnel_logs(&self, tunnel_id: &str, limit: usize) -> RelayResult<Vec<LogEntry>> {
        self.lifecycle.status(tunnel_id)?;
        Ok(self.log.recent(tunnel_id, limit))
    }

    // ---- data plane ----

    /// Relay a public request to the tunnel behind `subdomain`
    pub async fn forward(&self, subdomain: &str, request: Bytes) -> RelayResult<ExchangeStream> {
        self.multiplexer.forward(subdomain, request).await
    }

    // ---- control connections ----

    /// Admit a control connection. A connection it replaces is closed and
    /// the agent's tunnels are reset so they restart on the new one.
    pub fn admit(
        &self,
        token: &str,
        link: &Arc<AgentLink>,
        metadata: AgentMetadata,
    ) -> RelayResult<Admission> {
        let admission = self.registry.admit(token, link, metadata)?;

        if let Some(old) = &admission.replaced {
            self.lifecycle.on_agent_replaced(&admission.agent_id);
            old.close("replaced by a newer connection");
        }
        self.emit(CoreEvent::AgentConnected {
            agent_id: admission.agent_id.clone(),
            owner_id: admission.owner_id.clone(),
        });
        Ok(admission)
    }

    /// Start the tunnels of a freshly admitted agent; returns how many became active
    pub async fn agent_online(&self, agent_id: &str) -> usize {
        self.lifecycle.on_agent_online(agent_id).await
    }

    /// Take an agent offline regardless of which connection it holds. Idempotent.
    pub fn release(&self, agent_id: &str) -> bool {
        match self.registry.release(agent_id) {
            Some(released) => {
                self.finish_release(released, "released by relay");
                true
            }
            None => false,
        }
    }

    /// Take an agent offline if `connection_id` is still its connection
    pub fn release_connection(
        &self,
        agent_id: &str,
        connection_id: u64,
        error: Option<String>,
    ) -> bool {
        let reason = error
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        match self
            .registry
            .release_connection(agent_id, connection_id, error)
        {
            Some(released) => {
                self.finish_release(released, &reason);
                true
            }
            None => false,
        }
    }

    /// Release an agent that stopped heartbeating
    pub(crate) fn expire(&self, agent_id: &str, connection_id: u64) -> bool {
        match self
            .registry
            .release_connection(agent_id, connection_id, None)
        {
            Some(released) => {
                self.finish_release(released, "heartbeat timeout");
                true
            }
            None => false,
        }
    }

    fn finish_release(&self, released: Released, reason: &str) {
        if let Some(link) = &released.link {
            link.close(reason);
        }
        let deactivated = self.lifecycle.on_agent_offline(&released.agent_id);

        info!(
            agent_id = %released.agent_id,
            reason = %reason,
            tunnels = deactivated,
            "Agent offline"
        );
        self.emit(CoreEvent::AgentDisconnected {
            agent_id: released.agent_id,
            owner_id: released.owner_id,
            reason: reason.to_string(),
        });
    }

    /// Run the liveness sweep until `shutdown` fires
    pub fn spawn_heartbeat_monitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = HeartbeatMonitor::new(self.clone());
        tokio::spawn(monitor.run(shutdown))
    }
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("base_domain", &self.config.base_domain)
            .field("agents", &self.registry.len())
            .field("tunnels", &self.lifecycle.len())
            .field("routes", &self.router.len())
            .finish()
    }
}
