//! Tunnel lifecycle controller
//!
//! Owns the state of every tunnel:
//!
//! ```text
//! Requested --start directive--> Connecting --ack--> Active
//!                                Connecting --nack / timeout / agent offline--> Error
//! Active    --stop / agent offline--> Inactive
//! Inactive  --start, agent online--> Connecting
//! Inactive  --start, agent offline--> Error
//! *         --delete--> removed, route unpublished
//! ```
//!
//! Every start or stop bumps the tunnel's generation. An acknowledgment that
//! arrives for an older generation (the tunnel was stopped or restarted while
//! the directive was in flight) is ignored.

use crate::agent_registry::AgentRegistry;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::event_log::EventLog;
use crate::model::{
    public_url, AgentId, CoreEvent, OwnerId, TunnelId, TunnelState, TunnelStats, TunnelStatus,
};
use burrow_proto::{LocalTarget, RelayMessage, TunnelKind};
use burrow_router::{
    normalize_label, random_label, RouteError, SubdomainCandidates, SubdomainRouter, TunnelRoute,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Default)]
struct TunnelCounters {
    exchanges: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Unix milliseconds, 0 when no exchange happened yet
    last_exchange_ms: AtomicI64,
}

impl TunnelCounters {
    fn snapshot(&self) -> TunnelStats {
        let last_ms = self.last_exchange_ms.load(Ordering::Relaxed);
        TunnelStats {
            exchanges: self.exchanges.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            last_exchange_at: (last_ms > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_ms))
                .flatten(),
        }
    }
}

struct TunnelEntry {
    id: TunnelId,
    owner_id: OwnerId,
    agent_id: AgentId,
    name: String,
    subdomain: String,
    kind: TunnelKind,
    local_target: LocalTarget,
    public_url: String,
    state: TunnelState,
    error: Option<String>,
    explicitly_stopped: bool,
    generation: u64,
    counters: TunnelCounters,
    created_at: DateTime<Utc>,
}

impl TunnelEntry {
    fn snapshot(&self) -> TunnelStatus {
        TunnelStatus {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            subdomain: self.subdomain.clone(),
            kind: self.kind,
            local_target: self.local_target.clone(),
            public_url: self.public_url.clone(),
            state: self.state,
            error: self.error.clone(),
            explicitly_stopped: self.explicitly_stopped,
            stats: self.counters.snapshot(),
            created_at: self.created_at,
        }
    }

    fn state_event(&self) -> CoreEvent {
        CoreEvent::TunnelStateChanged {
            tunnel_id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            state: self.state,
            error: self.error.clone(),
        }
    }

    fn start_directive(&self) -> RelayMessage {
        RelayMessage::StartTunnel {
            tunnel_id: self.id.clone(),
            generation: self.generation,
            subdomain: self.subdomain.clone(),
            kind: self.kind,
            local_target: self.local_target.clone(),
        }
    }
}

pub struct TunnelLifecycle {
    tunnels: RwLock<HashMap<TunnelId, TunnelEntry>>,
    registry: Arc<AgentRegistry>,
    router: Arc<SubdomainRouter>,
    config: Arc<RelayConfig>,
    log: Arc<EventLog>,
    events: broadcast::Sender<CoreEvent>,
}

impl TunnelLifecycle {
    pub fn new(
        registry: Arc<AgentRegistry>,
        router: Arc<SubdomainRouter>,
        config: Arc<RelayConfig>,
        log: Arc<EventLog>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            registry,
            router,
            config,
            log,
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TunnelId, TunnelEntry>> {
        self.tunnels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TunnelId, TunnelEntry>> {
        self.tunnels.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create a tunnel on `agent_id`, claim a subdomain for it and publish
    /// the route. If the agent is online the start directive is sent right
    /// away and this waits (bounded by the ack timeout) for the answer.
    pub async fn create(
        &self,
        owner_id: &str,
        agent_id: &str,
        name: &str,
        kind: TunnelKind,
        local_target: LocalTarget,
    ) -> RelayResult<TunnelStatus> {
        self.check_agent(owner_id, agent_id)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RelayError::InvalidRequest("tunnel name must not be empty".into()));
        }
        if local_target.host.is_empty() || local_target.port == 0 {
            return Err(RelayError::InvalidRequest(format!(
                "invalid local target '{}'",
                local_target
            )));
        }

        let tunnel_id = uuid::Uuid::new_v4().to_string();
        let base = match normalize_label(name) {
            base if base.is_empty() => random_label(),
            base => base,
        };

        let mut claimed = None;
        for candidate in SubdomainCandidates::new(base.clone(), self.config.max_subdomain_attempts)
        {
            let route = TunnelRoute {
                tunnel_id: tunnel_id.clone(),
                agent_id: agent_id.to_string(),
                subdomain: candidate.clone(),
                kind,
                local_target: local_target.clone(),
            };
            match self.router.publish(route) {
                Ok(()) => {
                    claimed = Some(candidate);
                    break;
                }
                Err(RouteError::DuplicateSubdomain { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let Some(subdomain) = claimed else {
            warn!(base = %base, "Subdomain candidates exhausted");
            return Err(RelayError::SubdomainExhausted(base));
        };

        let entry = TunnelEntry {
            id: tunnel_id.clone(),
            owner_id: owner_id.to_string(),
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            public_url: public_url(kind, &subdomain, &self.config.base_domain),
            subdomain: subdomain.clone(),
            kind,
            local_target,
            state: TunnelState::Requested,
            error: None,
            explicitly_stopped: false,
            generation: 0,
            counters: TunnelCounters::default(),
            created_at: Utc::now(),
        };
        let event = entry.state_event();
        self.write().insert(tunnel_id.clone(), entry);

        // The agent may have been retired while the subdomain was claimed
        if let Err(e) = self.check_agent(owner_id, agent_id) {
            self.write().remove(&tunnel_id);
            self.router.unpublish(&tunnel_id);
            debug!(tunnel_id = %tunnel_id, agent_id = %agent_id, "Dropped tunnel of a retired agent");
            return Err(e);
        }

        info!(
            tunnel_id = %tunnel_id,
            agent_id = %agent_id,
            subdomain = %subdomain,
            "Created tunnel"
        );
        self.log
            .info(&tunnel_id, format!("Tunnel created as '{}'", subdomain));
        self.emit(event);

        if self.registry.is_online(agent_id) {
            return self.activate(&tunnel_id).await;
        }
        self.status(&tunnel_id)
    }

    /// Tunnels are only bound to active agents of the same owner
    fn check_agent(&self, owner_id: &str, agent_id: &str) -> RelayResult<()> {
        if self.registry.owner_of(agent_id)? != owner_id {
            return Err(RelayError::agent_not_found(agent_id));
        }
        if !self.registry.is_active(agent_id) {
            return Err(RelayError::InvalidRequest(format!(
                "agent {} is deactivated",
                agent_id
            )));
        }
        Ok(())
    }

    /// Send the start directive and wait for the agent's answer.
    ///
    /// Leaves the tunnel untouched if the agent is not connected.
    async fn activate(&self, tunnel_id: &str) -> RelayResult<TunnelStatus> {
        let agent_id = self.agent_of(tunnel_id)?;
        let Ok(link) = self.registry.lookup(&agent_id) else {
            return self.status(tunnel_id);
        };

        let (generation, directive, event) = {
            let mut tunnels = self.write();
            let entry = tunnels
                .get_mut(tunnel_id)
                .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))?;
            entry.generation += 1;
            entry.state = TunnelState::Connecting;
            entry.error = None;
            (entry.generation, entry.start_directive(), entry.state_event())
        };
        self.emit(event);
        debug!(tunnel_id = %tunnel_id, agent_id = %agent_id, "Sending start directive");

        let ack = link.expect_ack(tunnel_id, generation);
        let ack_timeout = self.config.ack_timeout;
        let answer = tokio::time::timeout(ack_timeout, async {
            link.send(directive).await.map_err(|e| e.reason())?;
            match ack.await {
                Ok(result) => result,
                Err(_) => Err("agent disconnected before acknowledging".to_string()),
            }
        })
        .await;

        let result = match answer {
            Ok(result) => result,
            Err(_) => {
                link.forget_ack(tunnel_id, generation);
                Err(format!(
                    "no acknowledgment within {}ms",
                    ack_timeout.as_millis()
                ))
            }
        };

        match result {
            Ok(()) => self.settle(tunnel_id, generation, TunnelState::Active, None),
            Err(reason) => self.settle(tunnel_id, generation, TunnelState::Error, Some(reason)),
        };
        self.status(tunnel_id)
    }

    /// Finish an activation if nothing overtook it
    fn settle(
        &self,
        tunnel_id: &str,
        generation: u64,
        state: TunnelState,
        error: Option<String>,
    ) -> bool {
        let event = {
            let mut tunnels = self.write();
            let Some(entry) = tunnels.get_mut(tunnel_id) else {
                return false;
            };
            if entry.generation != generation || entry.state != TunnelState::Connecting {
                debug!(tunnel_id = %tunnel_id, "Ignoring late directive answer");
                return false;
            }
            entry.state = state;
            entry.error = error.clone();
            entry.state_event()
        };

        match &error {
            None => {
                info!(tunnel_id = %tunnel_id, "Tunnel active");
                self.log.info(tunnel_id, "Tunnel active");
            }
            Some(reason) => {
                warn!(tunnel_id = %tunnel_id, reason = %reason, "Tunnel failed to start");
                self.log
                    .error(tunnel_id, format!("Failed to start: {}", reason));
            }
        }
        self.emit(event);
        true
    }

    /// Start a tunnel. Active or connecting tunnels are left as they are.
    pub async fn start(&self, tunnel_id: &str) -> RelayResult<TunnelStatus> {
        let (state, agent_id) = {
            let mut tunnels = self.write();
            let entry = tunnels
                .get_mut(tunnel_id)
                .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))?;
            if !matches!(entry.state, TunnelState::Active | TunnelState::Connecting) {
                entry.explicitly_stopped = false;
            }
            (entry.state, entry.agent_id.clone())
        };

        match state {
            TunnelState::Active | TunnelState::Connecting => return self.status(tunnel_id),
            _ => {}
        }

        if self.registry.is_online(&agent_id) {
            return self.activate(tunnel_id).await;
        }
        if state == TunnelState::Requested {
            return self.status(tunnel_id);
        }

        let event = {
            let mut tunnels = self.write();
            let entry = tunnels
                .get_mut(tunnel_id)
                .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))?;
            entry.generation += 1;
            entry.state = TunnelState::Error;
            entry.error = Some("agent offline".to_string());
            entry.state_event()
        };
        info!(tunnel_id = %tunnel_id, agent_id = %agent_id, "Start requested while agent offline");
        self.log.warn(tunnel_id, "Start failed: agent offline");
        self.emit(event);
        self.status(tunnel_id)
    }

    /// Stop a tunnel. Anything but a still-requested tunnel ends up Inactive.
    pub fn stop(&self, tunnel_id: &str) -> RelayResult<TunnelStatus> {
        let (previous, agent_id, event) = {
            let mut tunnels = self.write();
            let entry = tunnels
                .get_mut(tunnel_id)
                .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))?;
            if entry.state == TunnelState::Requested {
                return Ok(entry.snapshot());
            }
            let previous = entry.state;
            entry.generation += 1;
            entry.state = TunnelState::Inactive;
            entry.error = None;
            entry.explicitly_stopped = true;
            (previous, entry.agent_id.clone(), entry.state_event())
        };

        if matches!(previous, TunnelState::Active | TunnelState::Connecting) {
            self.withdraw_from_agent(tunnel_id, &agent_id);
        }
        if previous != TunnelState::Inactive {
            info!(tunnel_id = %tunnel_id, "Tunnel stopped");
            self.log.info(tunnel_id, "Tunnel stopped");
            self.emit(event);
        }
        self.status(tunnel_id)
    }

    /// Remove a tunnel: stop it on the agent, unpublish its route, fail its exchanges
    pub fn delete(&self, tunnel_id: &str) -> RelayResult<()> {
        let entry = self
            .write()
            .remove(tunnel_id)
            .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))?;

        self.router.unpublish(tunnel_id);
        if matches!(entry.state, TunnelState::Active | TunnelState::Connecting) {
            self.withdraw_from_agent(tunnel_id, &entry.agent_id);
        } else if let Ok(link) = self.registry.lookup(&entry.agent_id) {
            link.cancel_tunnel_exchanges(tunnel_id);
        }

        info!(tunnel_id = %tunnel_id, subdomain = %entry.subdomain, "Deleted tunnel");
        self.log.forget(tunnel_id);
        self.emit(CoreEvent::TunnelDeleted {
            tunnel_id: entry.id,
            owner_id: entry.owner_id,
        });
        Ok(())
    }

    /// Delete every tunnel of an agent; returns how many were removed
    pub fn delete_for_agent(&self, agent_id: &str) -> usize {
        self.tunnel_ids_of(agent_id)
            .into_iter()
            .filter(|id| self.delete(id).is_ok())
            .count()
    }

    fn withdraw_from_agent(&self, tunnel_id: &str, agent_id: &str) {
        let Ok(link) = self.registry.lookup(agent_id) else {
            return;
        };
        let stop = RelayMessage::StopTunnel {
            tunnel_id: tunnel_id.to_string(),
        };
        if let Err(e) = link.try_send(stop) {
            debug!(tunnel_id = %tunnel_id, error = %e, "Could not send stop directive");
        }
        let cancelled = link.cancel_tunnel_exchanges(tunnel_id);
        if cancelled > 0 {
            debug!(tunnel_id = %tunnel_id, cancelled, "Cancelled in-flight exchanges");
        }
    }

    /// Agent came online: start its tunnels that were waiting for it or
    /// dropped with it. Explicitly stopped and failed tunnels stay put.
    pub async fn on_agent_online(&self, agent_id: &str) -> usize {
        let candidates: Vec<TunnelId> = self
            .read()
            .values()
            .filter(|entry| entry.agent_id == agent_id)
            .filter(|entry| match entry.state {
                TunnelState::Requested => true,
                TunnelState::Inactive => !entry.explicitly_stopped,
                _ => false,
            })
            .map(|entry| entry.id.clone())
            .collect();

        if candidates.is_empty() {
            return 0;
        }
        debug!(agent_id = %agent_id, count = candidates.len(), "Activating agent tunnels");

        join_all(candidates.iter().map(|id| self.activate(id)))
            .await
            .into_iter()
            .filter(|status| matches!(status, Ok(s) if s.state == TunnelState::Active))
            .count()
    }

    /// Agent went offline: active tunnels become Inactive, tunnels whose
    /// start directive was still unanswered become Error.
    pub fn on_agent_offline(&self, agent_id: &str) -> usize {
        self.drop_agent_tunnels(
            agent_id,
            Some("agent went offline before acknowledging"),
        )
    }

    /// Agent reconnected on a new connection: everything it was running is
    /// reset to Inactive so the next `on_agent_online` starts it again.
    pub fn on_agent_replaced(&self, agent_id: &str) -> usize {
        self.drop_agent_tunnels(agent_id, None)
    }

    fn drop_agent_tunnels(&self, agent_id: &str, connecting_error: Option<&str>) -> usize {
        let events: Vec<CoreEvent> = {
            let mut tunnels = self.write();
            tunnels
                .values_mut()
                .filter(|entry| entry.agent_id == agent_id)
                .filter_map(|entry| {
                    match entry.state {
                        TunnelState::Active => {
                            entry.state = TunnelState::Inactive;
                            entry.error = None;
                        }
                        TunnelState::Connecting => {
                            entry.generation += 1;
                            match connecting_error {
                                Some(reason) => {
                                    entry.state = TunnelState::Error;
                                    entry.error = Some(reason.to_string());
                                }
                                None => {
                                    entry.state = TunnelState::Inactive;
                                    entry.error = None;
                                }
                            }
                        }
                        _ => return None,
                    }
                    Some(entry.state_event())
                })
                .collect()
        };

        for event in &events {
            if let CoreEvent::TunnelStateChanged {
                tunnel_id, state, ..
            } = event
            {
                info!(tunnel_id = %tunnel_id, agent_id = %agent_id, state = %state, "Tunnel deactivated with its agent");
                self.log
                    .info(tunnel_id, format!("Agent disconnected, tunnel {}", state));
            }
        }
        let count = events.len();
        for event in events {
            self.emit(event);
        }
        count
    }

    /// `Ok` only while the tunnel is Active
    pub fn ensure_active(&self, tunnel_id: &str) -> RelayResult<()> {
        match self.state(tunnel_id) {
            Some(TunnelState::Active) => Ok(()),
            _ => Err(RelayError::TunnelNotActive(tunnel_id.to_string())),
        }
    }

    pub fn check_owner(&self, tunnel_id: &str, owner_id: &str) -> RelayResult<()> {
        match self.read().get(tunnel_id) {
            Some(entry) if entry.owner_id == owner_id => Ok(()),
            _ => Err(RelayError::tunnel_not_found(tunnel_id)),
        }
    }

    pub fn state(&self, tunnel_id: &str) -> Option<TunnelState> {
        self.read().get(tunnel_id).map(|entry| entry.state)
    }

    fn agent_of(&self, tunnel_id: &str) -> RelayResult<AgentId> {
        self.read()
            .get(tunnel_id)
            .map(|entry| entry.agent_id.clone())
            .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))
    }

    fn tunnel_ids_of(&self, agent_id: &str) -> Vec<TunnelId> {
        self.read()
            .values()
            .filter(|entry| entry.agent_id == agent_id)
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn status(&self, tunnel_id: &str) -> RelayResult<TunnelStatus> {
        self.read()
            .get(tunnel_id)
            .map(TunnelEntry::snapshot)
            .ok_or_else(|| RelayError::tunnel_not_found(tunnel_id))
    }

    /// Tunnels of one owner, oldest first
    pub fn list(&self, owner_id: &str) -> Vec<TunnelStatus> {
        let mut tunnels: Vec<TunnelStatus> = self
            .read()
            .values()
            .filter(|entry| entry.owner_id == owner_id)
            .map(TunnelEntry::snapshot)
            .collect();
        tunnels.sort_by_key(|status| status.created_at);
        tunnels
    }

    pub fn tunnels_of(&self, agent_id: &str) -> Vec<TunnelStatus> {
        let mut tunnels: Vec<TunnelStatus> = self
            .read()
            .values()
            .filter(|entry| entry.agent_id == agent_id)
            .map(TunnelEntry::snapshot)
            .collect();
        tunnels.sort_by_key(|status| status.created_at);
        tunnels
    }

    /// Count one relayed exchange and its request bytes
    pub fn record_exchange(&self, tunnel_id: &str, bytes_in: u64) {
        if let Some(entry) = self.read().get(tunnel_id) {
            entry.counters.exchanges.fetch_add(1, Ordering::Relaxed);
            entry.counters.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
            entry
                .counters
                .last_exchange_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    pub fn record_bytes_out(&self, tunnel_id: &str, bytes_out: u64) {
        if let Some(entry) = self.read().get(tunnel_id) {
            entry.counters.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatPolicy;
    use crate::link::AgentLink;
    use burrow_proto::AgentMetadata;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        lifecycle: Arc<TunnelLifecycle>,
        registry: Arc<AgentRegistry>,
        router: Arc<SubdomainRouter>,
        agent_id: String,
        token: String,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(EventLog::new(10));
        let config = Arc::new(
            RelayConfig::new("relay.test").with_ack_timeout(Duration::from_millis(200)),
        );
        let registry = Arc::new(AgentRegistry::new(HeartbeatPolicy::default(), log.clone()));
        let router = Arc::new(SubdomainRouter::new());
        let (events, _) = broadcast::channel(64);
        let lifecycle = Arc::new(TunnelLifecycle::new(
            registry.clone(),
            router.clone(),
            config,
            log,
            events,
        ));
        let record = registry.create_agent("user-1", "laptop").unwrap();
        Fixture {
            lifecycle,
            registry,
            router,
            agent_id: record.id,
            token: record.token,
        }
    }

    /// Admit the fixture agent; returns the link and its outbound queue
    fn connect(fx: &Fixture) -> (Arc<AgentLink>, mpsc::Receiver<RelayMessage>) {
        let (link, outbound) = AgentLink::new(fx.agent_id.clone(), "test", 32);
        fx.registry
            .admit(&fx.token, &link, AgentMetadata::default())
            .unwrap();
        (link, outbound)
    }

    /// Agent that acknowledges every start directive
    fn spawn_acking_agent(link: Arc<AgentLink>, mut outbound: mpsc::Receiver<RelayMessage>) {
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                if let RelayMessage::StartTunnel {
                    tunnel_id,
                    generation,
                    ..
                } = msg
                {
                    link.resolve_ack(&tunnel_id, generation, Ok(()));
                }
            }
        });
    }

    fn target() -> LocalTarget {
        LocalTarget::new("127.0.0.1", 8080)
    }

    #[tokio::test]
    async fn test_create_while_agent_offline_stays_requested() {
        let fx = fixture();
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();

        assert_eq!(status.state, TunnelState::Requested);
        assert_eq!(status.subdomain, "web");
        assert_eq!(status.public_url, "http://web.relay.test");
        // Published immediately
        assert_eq!(fx.router.resolve("web").unwrap().tunnel_id, status.id);
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_agent() {
        let fx = fixture();
        let err = fx
            .lifecycle
            .create("user-2", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound { .. }));
        assert!(fx.router.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_deactivated_agent() {
        let fx = fixture();
        fx.registry.deactivate(&fx.agent_id).unwrap();

        let err = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
        assert!(fx.router.is_empty());
        assert_eq!(fx.lifecycle.len(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_target() {
        let fx = fixture();
        let err = fx
            .lifecycle
            .create(
                "user-1",
                &fx.agent_id,
                "web",
                TunnelKind::Http,
                LocalTarget::new("127.0.0.1", 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_colliding_names_get_suffixes() {
        let fx = fixture();
        let mut subdomains = Vec::new();
        for _ in 0..3 {
            let status = fx
                .lifecycle
                .create("user-1", &fx.agent_id, "My App", TunnelKind::Http, target())
                .await
                .unwrap();
            subdomains.push(status.subdomain);
        }
        assert_eq!(subdomains, vec!["myapp", "myapp1", "myapp2"]);
    }

    #[tokio::test]
    async fn test_subdomain_exhausted() {
        let fx = fixture();
        let config = Arc::new(RelayConfig::new("relay.test").with_max_subdomain_attempts(1));
        let (events, _) = broadcast::channel(8);
        let lifecycle = TunnelLifecycle::new(
            fx.registry.clone(),
            fx.router.clone(),
            config,
            Arc::new(EventLog::new(10)),
            events,
        );

        lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        let err = lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::SubdomainExhausted("web".to_string()));
    }

    #[tokio::test]
    async fn test_unusable_name_gets_random_subdomain() {
        let fx = fixture();
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "!!!", TunnelKind::Tcp, target())
            .await
            .unwrap();
        assert_eq!(status.subdomain.len(), 6);
    }

    #[tokio::test]
    async fn test_create_with_online_agent_becomes_active() {
        let fx = fixture();
        let (link, outbound) = connect(&fx);
        spawn_acking_agent(link.clone(), outbound);

        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        assert_eq!(status.state, TunnelState::Active);
        assert!(fx.lifecycle.ensure_active(&status.id).is_ok());
    }

    #[tokio::test]
    async fn test_missing_ack_marks_error() {
        let fx = fixture();
        let (_link, _outbound) = connect(&fx);

        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        assert_eq!(status.state, TunnelState::Error);
        assert!(status.error.unwrap().contains("acknowledgment"));
    }

    #[tokio::test]
    async fn test_late_answer_to_superseded_directive_is_ignored() {
        let fx = fixture();
        let (link, mut outbound) = connect(&fx);

        // First directive goes unanswered until the ack timeout
        let first = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        assert_eq!(first.state, TunnelState::Error);
        let stale = match outbound.recv().await.unwrap() {
            RelayMessage::StartTunnel { generation, .. } => generation,
            other => panic!("expected start directive, got {:?}", other),
        };

        let restart = {
            let lifecycle = fx.lifecycle.clone();
            let tunnel_id = first.id.clone();
            tokio::spawn(async move { lifecycle.start(&tunnel_id).await })
        };
        let current = match outbound.recv().await.unwrap() {
            RelayMessage::StartTunnel { generation, .. } => generation,
            other => panic!("expected start directive, got {:?}", other),
        };
        assert!(current > stale);

        assert!(!link.resolve_ack(&first.id, stale, Err("port in use".to_string())));
        assert!(link.resolve_ack(&first.id, current, Ok(())));
        let status = restart.await.unwrap().unwrap();
        assert_eq!(status.state, TunnelState::Active);
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn test_nack_marks_error_with_reason() {
        let fx = fixture();
        let (link, mut outbound) = connect(&fx);
        let agent = link.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                if let RelayMessage::StartTunnel {
                    tunnel_id,
                    generation,
                    ..
                } = msg
                {
                    agent.resolve_ack(&tunnel_id, generation, Err("target unreachable".to_string()));
                }
            }
        });

        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        assert_eq!(status.state, TunnelState::Error);
        assert_eq!(status.error.as_deref(), Some("target unreachable"));
    }

    #[tokio::test]
    async fn test_agent_online_activates_requested_tunnels() {
        let fx = fixture();
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();

        let (link, outbound) = connect(&fx);
        spawn_acking_agent(link, outbound);

        assert_eq!(fx.lifecycle.on_agent_online(&fx.agent_id).await, 1);
        assert_eq!(fx.lifecycle.state(&status.id), Some(TunnelState::Active));
    }

    #[tokio::test]
    async fn test_agent_offline_deactivates_and_online_restores() {
        let fx = fixture();
        let (link, outbound) = connect(&fx);
        spawn_acking_agent(link, outbound);
        let running = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        let stopped = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "api", TunnelKind::Http, target())
            .await
            .unwrap();
        fx.lifecycle.stop(&stopped.id).unwrap();

        fx.registry.release(&fx.agent_id);
        assert_eq!(fx.lifecycle.on_agent_offline(&fx.agent_id), 1);
        assert_eq!(fx.lifecycle.state(&running.id), Some(TunnelState::Inactive));

        let (link, outbound) = connect(&fx);
        spawn_acking_agent(link, outbound);
        fx.lifecycle.on_agent_online(&fx.agent_id).await;

        assert_eq!(fx.lifecycle.state(&running.id), Some(TunnelState::Active));
        // Explicit stop survives reconnects
        assert_eq!(fx.lifecycle.state(&stopped.id), Some(TunnelState::Inactive));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_requested_is_untouched() {
        let fx = fixture();
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();

        let after = fx.lifecycle.stop(&status.id).unwrap();
        assert_eq!(after.state, TunnelState::Requested);

        let (link, outbound) = connect(&fx);
        spawn_acking_agent(link, outbound);
        fx.lifecycle.start(&status.id).await.unwrap();

        assert_eq!(
            fx.lifecycle.stop(&status.id).unwrap().state,
            TunnelState::Inactive
        );
        assert_eq!(
            fx.lifecycle.stop(&status.id).unwrap().state,
            TunnelState::Inactive
        );
    }

    #[tokio::test]
    async fn test_start_inactive_with_agent_offline_is_error() {
        let fx = fixture();
        let (link, outbound) = connect(&fx);
        spawn_acking_agent(link, outbound);
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();
        fx.lifecycle.stop(&status.id).unwrap();
        fx.registry.release(&fx.agent_id);

        let after = fx.lifecycle.start(&status.id).await.unwrap();
        assert_eq!(after.state, TunnelState::Error);
        assert_eq!(after.error.as_deref(), Some("agent offline"));
    }

    #[tokio::test]
    async fn test_delete_unpublishes() {
        let fx = fixture();
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();

        fx.lifecycle.delete(&status.id).unwrap();
        assert!(fx.router.resolve("web").is_err());
        assert!(fx.lifecycle.status(&status.id).is_err());
        assert!(matches!(
            fx.lifecycle.delete(&status.id),
            Err(RelayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_exchange_stats() {
        let fx = fixture();
        let status = fx
            .lifecycle
            .create("user-1", &fx.agent_id, "web", TunnelKind::Http, target())
            .await
            .unwrap();

        fx.lifecycle.record_exchange(&status.id, 100);
        fx.lifecycle.record_bytes_out(&status.id, 250);

        let stats = fx.lifecycle.status(&status.id).unwrap().stats;
        assert_eq!(stats.exchanges, 1);
        assert_eq!(stats.bytes_in, 100);
        assert_eq!(stats.bytes_out, 250);
        assert!(stats.last_exchange_at.is_some());
    }
}
