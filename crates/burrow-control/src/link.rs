//! Live control connection handle
//!
//! An `AgentLink` is owned by the session task serving one control
//! connection. Everything else (the registry, in-flight exchanges) refers to
//! it weakly, so a closed connection is never kept alive by bookkeeping.
//!
//! The link carries the per-connection state the relay needs:
//! - the bounded outbound queue drained by the session's writer task
//! - the pending-exchange table fed by the session's reader loop
//! - acknowledgment waiters for tunnel directives

use crate::error::{RelayError, RelayResult};
use burrow_proto::{ExchangeId, FrameType, RelayFrame, RelayMessage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Final result of an exchange, set once before its chunk channel closes
pub(crate) type ExchangeOutcome = Arc<OnceLock<RelayResult<()>>>;

/// Result of a tunnel directive as reported by the agent
pub type AckResult = Result<(), String>;

struct PendingExchange {
    tunnel_id: String,
    chunks: mpsc::Sender<Bytes>,
    outcome: ExchangeOutcome,
}

impl PendingExchange {
    // Dropping `chunks` afterwards wakes the caller, which then reads the outcome
    fn finish(self, result: RelayResult<()>) {
        let _ = self.outcome.set(result);
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload of this many bytes handed to the waiting caller
    Delivered(usize),
    /// Exchange closed by `End` or `Error`
    Completed,
    /// No pending exchange with this id (timed out, cancelled or never existed)
    Unknown,
    /// Caller fell behind its buffer; exchange aborted with `AgentBusy`
    Overflowed,
    /// Caller went away before the frame arrived
    Abandoned,
    /// Agents never open exchanges
    Rejected,
}

pub struct AgentLink {
    connection_id: u64,
    agent_id: String,
    peer: String,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<RelayMessage>,
    closed: CancellationToken,
    pending: DashMap<ExchangeId, PendingExchange>,
    next_exchange_id: AtomicU64,
    /// Waiters keyed by tunnel id, tagged with the directive's generation
    acks: DashMap<String, (u64, oneshot::Sender<AckResult>)>,
}

impl AgentLink {
    /// Create a link and the receiving end of its outbound queue
    pub fn new(
        agent_id: impl Into<String>,
        peer: impl Into<String>,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<RelayMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let link = Arc::new(Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            agent_id: agent_id.into(),
            peer: peer.into(),
            connected_at: Utc::now(),
            outbound,
            closed: CancellationToken::new(),
            pending: DashMap::new(),
            next_exchange_id: AtomicU64::new(1),
            acks: DashMap::new(),
        });
        (link, outbound_rx)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Queue a message without waiting. A full queue is `AgentBusy`.
    pub fn try_send(&self, msg: RelayMessage) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::AgentOffline(self.agent_id.clone()));
        }
        self.outbound.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::AgentBusy(self.agent_id.clone()),
            TrySendError::Closed(_) => RelayError::AgentOffline(self.agent_id.clone()),
        })
    }

    /// Queue a message, waiting for room in the outbound queue
    pub async fn send(&self, msg: RelayMessage) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::AgentOffline(self.agent_id.clone()));
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(RelayError::AgentOffline(self.agent_id.clone())),
            res = self.outbound.send(msg) => {
                res.map_err(|_| RelayError::AgentOffline(self.agent_id.clone()))
            }
        }
    }

    /// Close the link: tell the agent why, fail everything waiting on it.
    ///
    /// Safe to call more than once; only the first call has an effect.
    pub fn close(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        debug!(
            agent_id = %self.agent_id,
            connection_id = self.connection_id,
            reason = %reason,
            "Closing agent link"
        );

        // Queued ahead of the cancellation so the writer flushes it on its way out
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(RelayMessage::Disconnect {
            reason: reason.to_string(),
        }) {
            warn!(
                agent_id = %self.agent_id,
                connection_id = self.connection_id,
                "Outbound queue full, closing without disconnect notice"
            );
        }
        self.closed.cancel();

        let ids: Vec<ExchangeId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let err = RelayError::TunnelNotActive(pending.tunnel_id.clone());
                pending.finish(Err(err));
            }
        }

        // Dropping the senders wakes every directive still waiting for an ack
        self.acks.clear();
    }

    // ---- exchanges ----

    pub(crate) fn register_exchange(
        &self,
        tunnel_id: &str,
        buffer: usize,
    ) -> (ExchangeId, mpsc::Receiver<Bytes>, ExchangeOutcome) {
        let exchange_id = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        let (chunks, chunks_rx) = mpsc::channel(buffer.max(1));
        let outcome: ExchangeOutcome = Arc::new(OnceLock::new());

        self.pending.insert(
            exchange_id,
            PendingExchange {
                tunnel_id: tunnel_id.to_string(),
                chunks,
                outcome: outcome.clone(),
            },
        );
        trace!(
            agent_id = %self.agent_id,
            tunnel_id = %tunnel_id,
            exchange_id,
            "Registered exchange"
        );

        (exchange_id, chunks_rx, outcome)
    }

    /// Route one inbound frame to the caller waiting on its exchange
    pub(crate) fn deliver(&self, frame: RelayFrame) -> Delivery {
        let exchange_id = frame.exchange_id;

        match frame.frame_type {
            FrameType::Open => Delivery::Rejected,
            FrameType::Data => {
                let len = frame.payload.len();
                let sent = match self.pending.get(&exchange_id) {
                    Some(pending) if pending.tunnel_id == frame.tunnel_id => {
                        pending.chunks.try_send(Bytes::from(frame.payload))
                    }
                    _ => return Delivery::Unknown,
                };

                match sent {
                    Ok(()) => Delivery::Delivered(len),
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            agent_id = %self.agent_id,
                            tunnel_id = %frame.tunnel_id,
                            exchange_id,
                            "Exchange buffer full, aborting exchange"
                        );
                        self.abort_exchange(
                            exchange_id,
                            RelayError::AgentBusy(self.agent_id.clone()),
                            Some("relay buffer full"),
                        );
                        Delivery::Overflowed
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.abort_exchange(
                            exchange_id,
                            RelayError::TunnelNotActive(frame.tunnel_id.clone()),
                            Some("cancelled by client"),
                        );
                        Delivery::Abandoned
                    }
                }
            }
            FrameType::End | FrameType::Error => {
                let removed = self
                    .pending
                    .remove_if(&exchange_id, |_, p| p.tunnel_id == frame.tunnel_id);
                let Some((_, pending)) = removed else {
                    return Delivery::Unknown;
                };

                if frame.frame_type == FrameType::End {
                    pending.finish(Ok(()));
                } else {
                    pending.finish(Err(RelayError::Upstream(frame.error_reason())));
                }
                Delivery::Completed
            }
        }
    }

    /// Drop a pending exchange from the relay side, failing its caller with
    /// `outcome`.
    ///
    /// With an `upstream_reason` an `Error` frame is queued so the agent stops
    /// working on it. Returns `false` if the exchange was already gone.
    pub(crate) fn abort_exchange(
        &self,
        exchange_id: ExchangeId,
        outcome: RelayError,
        upstream_reason: Option<&str>,
    ) -> bool {
        let Some((_, pending)) = self.pending.remove(&exchange_id) else {
            return false;
        };
        let tunnel_id = pending.tunnel_id.clone();
        pending.finish(Err(outcome));

        if let Some(reason) = upstream_reason {
            let frame = RelayFrame::error(exchange_id, tunnel_id, reason);
            if let Err(e) = self.try_send(RelayMessage::Frame(frame)) {
                debug!(
                    agent_id = %self.agent_id,
                    exchange_id,
                    error = %e,
                    "Could not send abort frame"
                );
            }
        }
        true
    }

    /// Abort every exchange of one tunnel; returns how many were aborted
    pub(crate) fn cancel_tunnel_exchanges(&self, tunnel_id: &str) -> usize {
        let ids: Vec<ExchangeId> = self
            .pending
            .iter()
            .filter(|e| e.value().tunnel_id == tunnel_id)
            .map(|e| *e.key())
            .collect();

        ids.into_iter()
            .filter(|id| {
                self.abort_exchange(
                    *id,
                    RelayError::TunnelNotActive(tunnel_id.to_string()),
                    Some("tunnel stopped"),
                )
            })
            .count()
    }

    pub fn pending_exchanges(&self) -> usize {
        self.pending.len()
    }

    // ---- directive acknowledgments ----

    pub(crate) fn expect_ack(
        &self,
        tunnel_id: &str,
        generation: u64,
    ) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(tunnel_id.to_string(), (generation, tx));
        rx
    }

    /// Hand the agent's answer to the directive waiting on it.
    ///
    /// An answer to an older directive for the same tunnel is dropped.
    pub fn resolve_ack(&self, tunnel_id: &str, generation: u64, result: AckResult) -> bool {
        match self
            .acks
            .remove_if(tunnel_id, |_, (waiting, _)| *waiting == generation)
        {
            Some((_, (_, tx))) => tx.send(result).is_ok(),
            None => {
                debug!(
                    agent_id = %self.agent_id,
                    tunnel_id = %tunnel_id,
                    generation,
                    "Acknowledgment with no directive waiting"
                );
                false
            }
        }
    }

    /// Drop an abandoned waiter; a newer directive's waiter is left alone
    pub(crate) fn forget_ack(&self, tunnel_id: &str, generation: u64) {
        self.acks
            .remove_if(tunnel_id, |_, (waiting, _)| *waiting == generation);
    }
}

impl std::fmt::Debug for AgentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLink")
            .field("connection_id", &self.connection_id)
            .field("agent_id", &self.agent_id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish()
    }
}
