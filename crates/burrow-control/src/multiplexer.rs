//! Relay multiplexer
//!
//! Turns a public request into an exchange over the owning agent's control
//! connection and routes the agent's answer back by `exchange_id`.
//!
//! Isolation between agents comes from the data layout: every agent link
//! has its own bounded outbound queue and its own pending-exchange table, so
//! a stalled agent only ever fills its own queue.

use crate::agent_registry::AgentRegistry;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::lifecycle::TunnelLifecycle;
use crate::link::{AgentLink, Delivery, ExchangeOutcome};
use burrow_proto::{ExchangeId, RelayFrame, RelayMessage};
use burrow_router::SubdomainRouter;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub struct RelayMultiplexer {
    router: Arc<SubdomainRouter>,
    registry: Arc<AgentRegistry>,
    lifecycle: Arc<TunnelLifecycle>,
    config: Arc<RelayConfig>,
}

impl RelayMultiplexer {
    pub fn new(
        router: Arc<SubdomainRouter>,
        registry: Arc<AgentRegistry>,
        lifecycle: Arc<TunnelLifecycle>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            router,
            registry,
            lifecycle,
            config,
        }
    }

    /// Relay `request` to the tunnel published under `subdomain`.
    ///
    /// Returns once the whole request is queued for the agent; the response
    /// is read from the returned stream. Dropping the stream before it ends
    /// cancels the exchange on the agent.
    pub async fn forward(&self, subdomain: &str, request: Bytes) -> RelayResult<ExchangeStream> {
        let route = self
            .router
            .resolve(subdomain)
            .map_err(|_| RelayError::UnknownSubdomain(subdomain.to_string()))?;
        let tunnel_id = route.tunnel_id.clone();

        self.lifecycle.ensure_active(&tunnel_id)?;
        let link = self
            .registry
            .lookup(&route.agent_id)
            .map_err(|_| RelayError::TunnelNotActive(tunnel_id.clone()))?;

        let (exchange_id, chunks, outcome) =
            link.register_exchange(&tunnel_id, self.config.exchange_buffer);
        let mut stream = ExchangeStream {
            exchange_id,
            tunnel_id: tunnel_id.clone(),
            link: Arc::downgrade(&link),
            chunks,
            outcome,
            idle_timeout: self.config.exchange_timeout,
            opened: false,
            finished: false,
        };

        // Stopped or deleted between the check and the registration
        self.lifecycle.ensure_active(&tunnel_id)?;

        // Only the Open frame fails fast; the body then waits for queue room
        let open = RelayFrame::open(exchange_id, tunnel_id.as_str(), &route.local_target);
        link.try_send(RelayMessage::Frame(open)).map_err(|e| {
            if matches!(e, RelayError::AgentBusy(_)) {
                warn!(
                    agent_id = %route.agent_id,
                    tunnel_id = %tunnel_id,
                    "Agent outbound queue full, rejecting exchange"
                );
            }
            e
        })?;
        stream.opened = true;
        trace!(tunnel_id = %tunnel_id, exchange_id, bytes = request.len(), "Opened exchange");

        let send_body = async {
            for chunk in request.chunks(self.config.max_chunk_size) {
                let frame = RelayFrame::data(exchange_id, tunnel_id.as_str(), chunk.to_vec());
                link.send(RelayMessage::Frame(frame)).await?;
            }
            let end = RelayFrame::end(exchange_id, tunnel_id.as_str());
            link.send(RelayMessage::Frame(end)).await
        };
        match tokio::time::timeout(self.config.exchange_timeout, send_body).await {
            Ok(sent) => sent?,
            Err(_) => return Err(RelayError::RelayTimeout),
        }

        let bytes_in = request.len() as u64;
        self.lifecycle.record_exchange(&tunnel_id, bytes_in);
        self.registry.record_traffic(&route.agent_id, bytes_in);
        Ok(stream)
    }

    /// Route a frame received from `link` to the exchange waiting on it
    pub fn dispatch(&self, link: &AgentLink, frame: RelayFrame) -> Delivery {
        let exchange_id = frame.exchange_id;
        let frame_type = frame.frame_type;
        let tunnel_id = frame.tunnel_id.clone();

        let delivery = link.deliver(frame);
        match delivery {
            Delivery::Delivered(bytes) => {
                self.lifecycle.record_bytes_out(&tunnel_id, bytes as u64);
                self.registry.record_traffic(link.agent_id(), bytes as u64);
            }
            Delivery::Completed => {
                trace!(tunnel_id = %tunnel_id, exchange_id, frame_type = frame_type.as_str(), "Exchange completed");
            }
            Delivery::Unknown => {
                warn!(
                    agent_id = %link.agent_id(),
                    tunnel_id = %tunnel_id,
                    exchange_id,
                    frame_type = frame_type.as_str(),
                    "Dropping frame for unknown exchange"
                );
            }
            Delivery::Rejected => {
                warn!(
                    agent_id = %link.agent_id(),
                    exchange_id,
                    "Agent tried to open an exchange"
                );
            }
            Delivery::Overflowed | Delivery::Abandoned => {
                debug!(tunnel_id = %tunnel_id, exchange_id, ?delivery, "Exchange dropped");
            }
        }
        delivery
    }
}

/// Response side of one relayed exchange
pub struct ExchangeStream {
    exchange_id: ExchangeId,
    tunnel_id: String,
    link: Weak<AgentLink>,
    chunks: mpsc::Receiver<Bytes>,
    outcome: ExchangeOutcome,
    idle_timeout: Duration,
    /// The agent has seen the Open frame
    opened: bool,
    finished: bool,
}

impl ExchangeStream {
    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Next chunk of the response. `None` once the agent ended the exchange.
    ///
    /// Each call waits at most the exchange timeout; silence for longer
    /// aborts the exchange with `RelayTimeout`.
    pub async fn next_chunk(&mut self) -> Option<RelayResult<Bytes>> {
        if self.finished {
            return None;
        }

        match tokio::time::timeout(self.idle_timeout, self.chunks.recv()).await {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.finished = true;
                match self.outcome.get() {
                    Some(Ok(())) => None,
                    Some(Err(e)) => Some(Err(e.clone())),
                    None => Some(Err(RelayError::TunnelNotActive(self.tunnel_id.clone()))),
                }
            }
            Err(_) => {
                debug!(
                    tunnel_id = %self.tunnel_id,
                    exchange_id = self.exchange_id,
                    "Exchange timed out"
                );
                self.abort(RelayError::RelayTimeout, "relay timeout");
                Some(Err(RelayError::RelayTimeout))
            }
        }
    }

    /// Collect the whole response
    pub async fn read_to_end(mut self) -> RelayResult<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }

    fn abort(&mut self, outcome: RelayError, reason: &str) {
        self.finished = true;
        if let Some(link) = self.link.upgrade() {
            let upstream = self.opened.then_some(reason);
            link.abort_exchange(self.exchange_id, outcome, upstream);
        }
    }
}

impl Drop for ExchangeStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        trace!(
            tunnel_id = %self.tunnel_id,
            exchange_id = self.exchange_id,
            "Exchange abandoned by caller"
        );
        let outcome = RelayError::TunnelNotActive(self.tunnel_id.clone());
        self.abort(outcome, "cancelled by client");
    }
}

impl std::fmt::Debug for ExchangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeStream")
            .field("exchange_id", &self.exchange_id)
            .field("tunnel_id", &self.tunnel_id)
            .field("finished", &self.finished)
            .finish()
    }
}
