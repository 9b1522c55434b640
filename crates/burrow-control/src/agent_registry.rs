//! Agent registry
//!
//! Tracks every known agent, which of them currently holds a control
//! connection, and when each was last heard from. The table sits behind a
//! single reader-writer lock; liveness and traffic counters are atomics so
//! the per-frame `touch` only takes the read side.
//!
//! Tokens are never stored in the clear: the registry keeps a SHA-256 digest
//! index from token to agent id.

use crate::config::HeartbeatPolicy;
use crate::error::{RelayError, RelayResult};
use crate::event_log::EventLog;
use crate::link::AgentLink;
use crate::model::{AgentId, AgentRecord, AgentState, AgentStats, AgentStatus, OwnerId};
use burrow_proto::AgentMetadata;
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Result of a successful `admit`
#[derive(Debug)]
pub struct Admission {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    pub link: Arc<AgentLink>,
    pub policy: HeartbeatPolicy,
    /// Connection that held the slot before; detached, still to be closed
    pub replaced: Option<Arc<AgentLink>>,
}

/// An agent that just went offline
#[derive(Debug)]
pub struct Released {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    /// The connection it held, if still alive
    pub link: Option<Arc<AgentLink>>,
}

struct AgentEntry {
    id: AgentId,
    owner_id: OwnerId,
    name: String,
    token_hash: String,
    active: bool,
    state: AgentState,
    error: Option<String>,
    connection: Option<Weak<AgentLink>>,
    connection_id: Option<u64>,
    peer: Option<String>,
    connected_since: Option<DateTime<Utc>>,
    metadata: Option<AgentMetadata>,
    policy: Option<HeartbeatPolicy>,
    seen: bool,
    /// Milliseconds since the registry epoch
    last_seen_ms: AtomicU64,
    bytes_transferred: AtomicU64,
    total_connections: u64,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct AgentTable {
    agents: HashMap<AgentId, AgentEntry>,
    /// sha256(token) -> agent id
    tokens: HashMap<String, AgentId>,
}

pub struct AgentRegistry {
    table: RwLock<AgentTable>,
    default_policy: HeartbeatPolicy,
    epoch: Instant,
    log: Arc<EventLog>,
    /// Bumped whenever an online agent may have gained a tighter policy
    policies: watch::Sender<u64>,
}

impl AgentRegistry {
    pub fn new(default_policy: HeartbeatPolicy, log: Arc<EventLog>) -> Self {
        let (policies, _) = watch::channel(0);
        Self {
            table: RwLock::new(AgentTable::default()),
            default_policy,
            epoch: Instant::now(),
            log,
            policies,
        }
    }

    /// Notified when the set of heartbeat policies in force changes
    pub fn watch_policies(&self) -> watch::Receiver<u64> {
        self.policies.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, AgentTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AgentTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a new agent with a freshly generated token
    pub fn create_agent(&self, owner_id: &str, name: &str) -> RelayResult<AgentRecord> {
        let mut table = self.write();
        let token = loop {
            let candidate = generate_token();
            if !table.tokens.contains_key(&hash_token(&candidate)) {
                break candidate;
            }
        };
        self.insert(&mut table, owner_id, name, token)
    }

    /// Register a new agent with a caller-chosen token (pre-provisioned agents)
    pub fn create_agent_with_token(
        &self,
        owner_id: &str,
        name: &str,
        token: &str,
    ) -> RelayResult<AgentRecord> {
        if token.trim().is_empty() {
            return Err(RelayError::InvalidRequest("token must not be empty".into()));
        }
        let mut table = self.write();
        if table.tokens.contains_key(&hash_token(token)) {
            return Err(RelayError::InvalidRequest("token already in use".into()));
        }
        self.insert(&mut table, owner_id, name, token.to_string())
    }

    fn insert(
        &self,
        table: &mut AgentTable,
        owner_id: &str,
        name: &str,
        token: String,
    ) -> RelayResult<AgentRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RelayError::InvalidRequest("agent name must not be empty".into()));
        }
        if owner_id.is_empty() {
            return Err(RelayError::InvalidRequest("owner id must not be empty".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let token_hash = hash_token(&token);
        table.tokens.insert(token_hash.clone(), id.clone());
        table.agents.insert(
            id.clone(),
            AgentEntry {
                id: id.clone(),
                owner_id: owner_id.to_string(),
                name: name.to_string(),
                token_hash,
                active: true,
                state: AgentState::Offline,
                error: None,
                connection: None,
                connection_id: None,
                peer: None,
                connected_since: None,
                metadata: None,
                policy: None,
                seen: false,
                last_seen_ms: AtomicU64::new(0),
                bytes_transferred: AtomicU64::new(0),
                total_connections: 0,
                created_at: Utc::now(),
            },
        );

        tracing::info!(agent_id = %id, owner_id = %owner_id, name = %name, "Created agent");
        self.log.info(&id, "Agent created");

        Ok(AgentRecord {
            id,
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            token,
        })
    }

    /// Remove an agent owned by `owner_id`. Returns its live connection, if any.
    pub fn delete_agent(
        &self,
        agent_id: &str,
        owner_id: &str,
    ) -> RelayResult<Option<Arc<AgentLink>>> {
        let mut table = self.write();
        match table.agents.get(agent_id) {
            Some(entry) if entry.owner_id == owner_id => {}
            _ => return Err(RelayError::agent_not_found(agent_id)),
        }

        let Some(entry) = table.agents.remove(agent_id) else {
            return Err(RelayError::agent_not_found(agent_id));
        };
        table.tokens.remove(&entry.token_hash);
        drop(table);

        tracing::info!(agent_id = %agent_id, "Deleted agent");
        self.log.forget(agent_id);
        Ok(entry.connection.and_then(|weak| weak.upgrade()))
    }

    /// Replace the agent's token. The current connection stays admitted.
    pub fn regenerate_token(&self, agent_id: &str) -> RelayResult<String> {
        let mut table = self.write();
        let old_hash = table
            .agents
            .get(agent_id)
            .map(|entry| entry.token_hash.clone())
            .ok_or_else(|| RelayError::agent_not_found(agent_id))?;

        let token = loop {
            let candidate = generate_token();
            if !table.tokens.contains_key(&hash_token(&candidate)) {
                break candidate;
            }
        };
        let new_hash = hash_token(&token);

        table.tokens.remove(&old_hash);
        table.tokens.insert(new_hash.clone(), agent_id.to_string());
        if let Some(entry) = table.agents.get_mut(agent_id) {
            entry.token_hash = new_hash;
        }
        drop(table);

        tracing::info!(agent_id = %agent_id, "Regenerated agent token");
        self.log.info(agent_id, "Token regenerated");
        Ok(token)
    }

    /// Refuse future admissions. A connected agent is released.
    pub fn deactivate(&self, agent_id: &str) -> RelayResult<Option<Released>> {
        let released = self.retire(agent_id)?;
        tracing::info!(agent_id = %agent_id, "Deactivated agent");
        self.log.warn(agent_id, "Agent deactivated");
        Ok(released)
    }

    /// Mark the agent inactive and detach its connection. Inactive agents
    /// are refused both admission and new tunnels.
    pub fn retire(&self, agent_id: &str) -> RelayResult<Option<Released>> {
        let mut table = self.write();
        let entry = table
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::agent_not_found(agent_id))?;

        entry.active = false;
        if entry.state == AgentState::Online || entry.connection.is_some() {
            Ok(Some(detach(entry, AgentState::Offline, None)))
        } else {
            Ok(None)
        }
    }

    /// Override the heartbeat policy of one agent.
    ///
    /// The silence window of a connected agent restarts from now, so a
    /// tighter policy is measured from the moment it was set.
    pub fn set_policy(&self, agent_id: &str, policy: HeartbeatPolicy) -> RelayResult<()> {
        let now_ms = self.now_ms();
        let mut table = self.write();
        let entry = table
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::agent_not_found(agent_id))?;
        entry.policy = Some(policy);
        if entry.state == AgentState::Online {
            entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
        }
        drop(table);
        self.policies.send_modify(|version| *version += 1);

        tracing::info!(
            agent_id = %agent_id,
            interval_ms = policy.interval.as_millis() as u64,
            max_missed = policy.max_missed,
            "Updated heartbeat policy"
        );
        Ok(())
    }

    pub fn policy_of(&self, agent_id: &str) -> RelayResult<HeartbeatPolicy> {
        self.read()
            .agents
            .get(agent_id)
            .map(|entry| entry.policy.unwrap_or(self.default_policy))
            .ok_or_else(|| RelayError::agent_not_found(agent_id))
    }

    /// Agent id a token belongs to
    pub fn authenticate(&self, token: &str) -> RelayResult<AgentId> {
        let table = self.read();
        let agent_id = table
            .tokens
            .get(&hash_token(token))
            .ok_or_else(|| RelayError::Auth("invalid or rotated token".into()))?;
        match table.agents.get(agent_id) {
            Some(entry) if !entry.active => Err(RelayError::Auth("agent is deactivated".into())),
            Some(_) => Ok(agent_id.clone()),
            None => Err(RelayError::Auth("invalid or rotated token".into())),
        }
    }

    /// Admit `link` as the agent's control connection.
    ///
    /// The token is checked again against the link's agent. Any connection
    /// already registered for the agent is detached and returned in
    /// `Admission::replaced`; the caller must close it.
    pub fn admit(
        &self,
        token: &str,
        link: &Arc<AgentLink>,
        metadata: AgentMetadata,
    ) -> RelayResult<Admission> {
        let now_ms = self.now_ms();
        let mut table = self.write();

        let agent_id = match table.tokens.get(&hash_token(token)) {
            Some(id) if id == link.agent_id() => id.clone(),
            _ => {
                tracing::warn!(peer = %link.peer(), "Rejected agent with unknown token");
                return Err(RelayError::Auth("invalid or rotated token".into()));
            }
        };
        let entry = table
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| RelayError::Auth("invalid or rotated token".into()))?;

        if !entry.active {
            tracing::warn!(agent_id = %agent_id, "Rejected deactivated agent");
            return Err(RelayError::Auth("agent is deactivated".into()));
        }

        let replaced = entry.connection.take().and_then(|weak| weak.upgrade());

        entry.connection = Some(Arc::downgrade(link));
        entry.connection_id = Some(link.connection_id());
        entry.peer = Some(link.peer().to_string());
        entry.connected_since = Some(link.connected_at());
        entry.state = AgentState::Online;
        entry.error = None;
        entry.metadata = Some(metadata);
        entry.seen = true;
        entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
        entry.total_connections += 1;

        let overridden = entry.policy.is_some();
        let admission = Admission {
            agent_id: agent_id.clone(),
            owner_id: entry.owner_id.clone(),
            link: link.clone(),
            policy: entry.policy.unwrap_or(self.default_policy),
            replaced,
        };
        drop(table);
        if overridden {
            self.policies.send_modify(|version| *version += 1);
        }

        if let Some(old) = &admission.replaced {
            tracing::info!(
                agent_id = %agent_id,
                old_connection = old.connection_id(),
                new_connection = link.connection_id(),
                "Agent reconnected, replacing previous connection"
            );
        } else {
            tracing::info!(
                agent_id = %agent_id,
                connection_id = link.connection_id(),
                peer = %link.peer(),
                "Agent admitted"
            );
        }
        self.log
            .info(&agent_id, format!("Connected from {}", link.peer()));

        Ok(admission)
    }

    /// Record that the agent was heard from
    pub fn touch(&self, agent_id: &str) {
        let now_ms = self.now_ms();
        if let Some(entry) = self.read().agents.get(agent_id) {
            entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
        }
    }

    pub fn record_traffic(&self, agent_id: &str, bytes: u64) {
        if let Some(entry) = self.read().agents.get(agent_id) {
            entry.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Mark the agent offline and forget its connection. Idempotent.
    pub fn release(&self, agent_id: &str) -> Option<Released> {
        let mut table = self.write();
        let entry = table.agents.get_mut(agent_id)?;
        if entry.state != AgentState::Online && entry.connection.is_none() {
            return None;
        }
        let released = detach(entry, AgentState::Offline, None);
        drop(table);

        tracing::info!(agent_id = %agent_id, "Agent released");
        self.log.info(agent_id, "Disconnected");
        Some(released)
    }

    /// Release only if `connection_id` still holds the agent's slot.
    ///
    /// A connection retired by a newer one must not take the agent offline
    /// when its own session finally ends. With `error` the agent is left in
    /// the `Error` state carrying that reason.
    pub fn release_connection(
        &self,
        agent_id: &str,
        connection_id: u64,
        error: Option<String>,
    ) -> Option<Released> {
        let mut table = self.write();
        let entry = table.agents.get_mut(agent_id)?;
        if entry.connection_id != Some(connection_id) {
            return None;
        }
        let state = if error.is_some() {
            AgentState::Error
        } else {
            AgentState::Offline
        };
        let released = detach(entry, state, error.clone());
        drop(table);

        match &error {
            Some(reason) => {
                tracing::warn!(agent_id = %agent_id, connection_id, reason = %reason, "Agent connection failed");
                self.log.error(agent_id, format!("Connection failed: {}", reason));
            }
            None => {
                tracing::info!(agent_id = %agent_id, connection_id, "Agent released");
                self.log.info(agent_id, "Disconnected");
            }
        }
        Some(released)
    }

    /// Live connection of an agent
    pub fn lookup(&self, agent_id: &str) -> RelayResult<Arc<AgentLink>> {
        let table = self.read();
        let entry = table
            .agents
            .get(agent_id)
            .ok_or_else(|| RelayError::agent_not_found(agent_id))?;

        if entry.state != AgentState::Online {
            return Err(RelayError::AgentOffline(agent_id.to_string()));
        }
        entry
            .connection
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .filter(|link| !link.is_closed())
            .ok_or_else(|| RelayError::AgentOffline(agent_id.to_string()))
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.lookup(agent_id).is_ok()
    }

    pub fn is_active(&self, agent_id: &str) -> bool {
        self.read()
            .agents
            .get(agent_id)
            .is_some_and(|entry| entry.active)
    }

    pub fn owner_of(&self, agent_id: &str) -> RelayResult<OwnerId> {
        self.read()
            .agents
            .get(agent_id)
            .map(|entry| entry.owner_id.clone())
            .ok_or_else(|| RelayError::agent_not_found(agent_id))
    }

    pub fn state(&self, agent_id: &str) -> Option<AgentState> {
        self.read().agents.get(agent_id).map(|entry| entry.state)
    }

    pub fn status(&self, agent_id: &str) -> RelayResult<AgentStatus> {
        let now_ms = self.now_ms();
        self.read()
            .agents
            .get(agent_id)
            .map(|entry| self.snapshot(entry, now_ms))
            .ok_or_else(|| RelayError::agent_not_found(agent_id))
    }

    /// Agents of one owner, oldest first
    pub fn list(&self, owner_id: &str) -> Vec<AgentStatus> {
        let now_ms = self.now_ms();
        let mut agents: Vec<AgentStatus> = self
            .read()
            .agents
            .values()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| self.snapshot(entry, now_ms))
            .collect();
        agents.sort_by_key(|status| status.created_at);
        agents
    }

    /// Every agent currently online
    pub fn active(&self) -> Vec<AgentStatus> {
        let now_ms = self.now_ms();
        let mut agents: Vec<AgentStatus> = self
            .read()
            .agents
            .values()
            .filter(|entry| entry.state == AgentState::Online)
            .map(|entry| self.snapshot(entry, now_ms))
            .collect();
        agents.sort_by_key(|status| status.connected_since);
        agents
    }

    /// Online agents silent for longer than their policy allows, with the
    /// connection each one holds
    pub fn stale_agents(&self) -> Vec<(AgentId, u64)> {
        let now_ms = self.now_ms();
        self.read()
            .agents
            .values()
            .filter(|entry| entry.state == AgentState::Online)
            .filter_map(|entry| {
                let policy = entry.policy.unwrap_or(self.default_policy);
                let silent_ms = now_ms.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed));
                if silent_ms > policy.threshold().as_millis() as u64 {
                    entry.connection_id.map(|id| (entry.id.clone(), id))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Shortest heartbeat interval overridden for an online agent
    pub fn shortest_policy_interval(&self) -> Option<Duration> {
        self.read()
            .agents
            .values()
            .filter(|entry| entry.state == AgentState::Online)
            .filter_map(|entry| entry.policy.map(|policy| policy.interval))
            .min()
    }

    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, entry: &AgentEntry, now_ms: u64) -> AgentStatus {
        let last_seen = entry.seen.then(|| {
            let silent_ms = now_ms.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed));
            Utc::now() - chrono::Duration::milliseconds(silent_ms as i64)
        });

        AgentStatus {
            id: entry.id.clone(),
            owner_id: entry.owner_id.clone(),
            name: entry.name.clone(),
            state: entry.state,
            active: entry.active,
            last_seen,
            connected_since: entry.connected_since,
            peer: entry.peer.clone(),
            metadata: entry.metadata.clone(),
            heartbeat: entry.policy.unwrap_or(self.default_policy),
            stats: AgentStats {
                total_connections: entry.total_connections,
                bytes_transferred: entry.bytes_transferred.load(Ordering::Relaxed),
            },
            error: entry.error.clone(),
            created_at: entry.created_at,
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.len())
            .finish()
    }
}

fn detach(entry: &mut AgentEntry, state: AgentState, error: Option<String>) -> Released {
    let link = entry.connection.take().and_then(|weak| weak.upgrade());
    entry.connection_id = None;
    entry.connected_since = None;
    entry.peer = None;
    entry.state = state;
    entry.error = error;

    Released {
        agent_id: entry.id.clone(),
        owner_id: entry.owner_id.clone(),
        link,
    }
}

/// 32 random bytes, hex encoded
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
