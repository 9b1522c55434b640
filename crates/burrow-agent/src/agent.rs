use crate::exchanges::{Delivery, ExchangeManager, Inbound};
use crate::forwarder::{ForwarderError, TcpForwarder};
use burrow_proto::{
    AgentMetadata, CodecError, FrameType, LocalTarget, RelayCodec, RelayFrame, RelayMessage,
    TunnelKind,
};
use dashmap::DashMap;
use futures::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to relay {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Relay rejected the agent: {0}")]
    Rejected(String),

    #[error("Relay did not answer hello within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Unexpected {0} message during handshake")]
    UnexpectedMessage(&'static str),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Gave up after {0} failed connection attempts")]
    ReconnectExhausted(u32),
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay control address (host:port)
    pub relay_addr: String,

    /// Token issued when the agent was created on the relay
    pub auth_token: String,

    /// Heartbeat interval used until the relay announces its own
    pub heartbeat_interval: Duration,

    /// Consecutive failed connection attempts before giving up (0 = never)
    pub max_reconnect_attempts: u32,

    /// Delay between connection attempts
    pub reconnect_delay: Duration,

    /// Reported to the relay in `Hello`
    pub metadata: AgentMetadata,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_addr: "localhost:7000".to_string(),
            auth_token: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
            metadata: AgentMetadata::default(),
        }
    }
}

/// A tunnel the relay asked this agent to serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub subdomain: String,
    pub kind: TunnelKind,
    pub local_target: LocalTarget,
}

/// How a welcomed session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown was requested
    Shutdown,
    /// The connection went away; reconnecting may help
    Lost(String),
}

/// The burrow agent: holds one control connection to the relay and
/// forwards the exchanges it receives to local targets
pub struct Agent {
    config: AgentConfig,
    tunnels: Arc<DashMap<String, TunnelInfo>>,
    exchanges: ExchangeManager,
    forwarder: Arc<TcpForwarder>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.relay_addr.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "relay address cannot be empty".to_string(),
            ));
        }
        if config.auth_token.is_empty() {
            return Err(AgentError::InvalidConfig(
                "auth token cannot be empty".to_string(),
            ));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }

        Ok(Self {
            config,
            tunnels: Arc::new(DashMap::new()),
            exchanges: ExchangeManager::default(),
            forwarder: Arc::new(TcpForwarder::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Tunnels currently served on this connection
    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        self.tunnels.iter().map(|t| t.value().clone()).collect()
    }

    pub fn active_exchanges(&self) -> usize {
        self.exchanges.count()
    }

    /// Connect to the relay and keep reconnecting until `shutdown` fires,
    /// the relay rejects the agent, or too many attempts fail in a row.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            tracing::info!(relay_addr = %self.config.relay_addr, "Connecting to relay");
            let result = match TcpStream::connect(&self.config.relay_addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.run_session(stream, shutdown.clone()).await
                }
                Err(e) => Err(AgentError::Connect {
                    address: self.config.relay_addr.clone(),
                    source: e,
                }),
            };

            match result {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Lost(reason)) => {
                    tracing::warn!(reason = %reason, "Relay connection lost");
                    failures = 0;
                }
                Err(AgentError::Rejected(reason)) => {
                    tracing::error!(reason = %reason, "Relay rejected the agent");
                    return Err(AgentError::Rejected(reason));
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, attempt = failures, "Connection attempt failed");
                    let max = self.config.max_reconnect_attempts;
                    if max > 0 && failures >= max {
                        return Err(AgentError::ReconnectExhausted(failures));
                    }
                }
            }

            tracing::info!(
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "Reconnecting after delay"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Run one control session over an established connection.
    ///
    /// Errors before the relay's `Welcome` are returned as `Err`; once
    /// welcomed, the session ends with a [`SessionEnd`].
    pub async fn run_session<T>(
        &self,
        io: T,
        shutdown: CancellationToken,
    ) -> Result<SessionEnd, AgentError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, RelayCodec::new());
        framed
            .send(RelayMessage::Hello {
                auth_token: self.config.auth_token.clone(),
                metadata: self.config.metadata.clone(),
            })
            .await?;

        let (agent_id, heartbeat_interval, max_missed) =
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
                Err(_) => return Err(AgentError::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
                Ok(None) => {
                    return Err(AgentError::ConnectionLost(
                        "relay closed the connection during handshake".to_string(),
                    ))
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(RelayMessage::Welcome {
                    agent_id,
                    heartbeat_interval_ms,
                    max_missed,
                }))) => (
                    agent_id,
                    self.heartbeat_interval(heartbeat_interval_ms),
                    max_missed.max(1),
                ),
                Ok(Some(Ok(RelayMessage::Rejected { reason }))) => {
                    return Err(AgentError::Rejected(reason))
                }
                Ok(Some(Ok(other))) => return Err(AgentError::UnexpectedMessage(other.kind())),
            };

        tracing::info!(
            agent_id = %agent_id,
            heartbeat_interval_ms = heartbeat_interval.as_millis() as u64,
            "Connected to relay"
        );

        let (sink, mut stream) = framed.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session_closed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, rx, session_closed.clone()));

        let mut heartbeat = heartbeat_ticker(heartbeat_interval);
        let mut silence_limit = heartbeat_interval * max_missed;
        let mut last_heard = Instant::now();

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = tx.try_send(RelayMessage::Disconnect {
                        reason: "agent shutting down".to_string(),
                    });
                    break SessionEnd::Shutdown;
                }
                _ = session_closed.cancelled() => {
                    break SessionEnd::Lost("failed to write to relay".to_string());
                }
                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > silence_limit {
                        break SessionEnd::Lost("relay stopped responding".to_string());
                    }
                    if tx.try_send(RelayMessage::Ping { timestamp: unix_millis() }).is_err() {
                        tracing::debug!("Outbound queue full, skipping heartbeat");
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(RelayMessage::ConfigUpdate {
                        heartbeat_interval_ms,
                        max_missed,
                    })) => {
                        last_heard = Instant::now();
                        let interval = self.heartbeat_interval(heartbeat_interval_ms);
                        heartbeat = heartbeat_ticker(interval);
                        silence_limit = interval * max_missed.max(1);
                        tracing::info!(
                            heartbeat_interval_ms = interval.as_millis() as u64,
                            max_missed,
                            "Relay updated heartbeat policy"
                        );
                    }
                    Some(Ok(msg)) => {
                        last_heard = Instant::now();
                        if let Some(end) = self.handle_message(msg, &tx).await {
                            break end;
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("relay closed the connection".to_string()),
                }
            }
        };

        // Directives are re-sent by the relay on the next connection
        self.exchanges.clear();
        self.tunnels.clear();
        session_closed.cancel();
        drop(tx);
        if let Err(e) = writer.await {
            tracing::debug!(error = %e, "Writer task ended abnormally");
        }

        tracing::info!(agent_id = %agent_id, end = ?end, "Relay session ended");
        Ok(end)
    }

    /// Heartbeat interval announced by the relay; zero keeps the local default
    fn heartbeat_interval(&self, announced_ms: u64) -> Duration {
        match announced_ms {
            0 => self.config.heartbeat_interval,
            ms => Duration::from_millis(ms),
        }
    }

    async fn handle_message(
        &self,
        msg: RelayMessage,
        tx: &mpsc::Sender<RelayMessage>,
    ) -> Option<SessionEnd> {
        match msg {
            RelayMessage::StartTunnel {
                tunnel_id,
                generation,
                subdomain,
                kind,
                local_target,
            } => {
                tracing::info!(
                    tunnel_id = %tunnel_id,
                    subdomain = %subdomain,
                    kind = %kind,
                    local_target = %local_target,
                    "Starting tunnel"
                );
                self.tunnels.insert(
                    tunnel_id.clone(),
                    TunnelInfo {
                        tunnel_id: tunnel_id.clone(),
                        subdomain,
                        kind,
                        local_target,
                    },
                );
                let _ = tx
                    .send(RelayMessage::TunnelAck {
                        tunnel_id,
                        generation,
                    })
                    .await;
            }
            RelayMessage::StopTunnel { tunnel_id } => {
                self.tunnels.remove(&tunnel_id);
                let cancelled = self.exchanges.cancel_tunnel(&tunnel_id);
                tracing::info!(tunnel_id = %tunnel_id, cancelled, "Tunnel stopped");
            }
            RelayMessage::Frame(frame) => self.handle_frame(frame, tx).await,
            RelayMessage::Ping { timestamp } => {
                let _ = tx.try_send(RelayMessage::Pong { timestamp });
            }
            RelayMessage::Pong { .. } => {}
            RelayMessage::Disconnect { reason } => {
                tracing::info!(reason = %reason, "Relay closed the session");
                return Some(SessionEnd::Lost(reason));
            }
            other => {
                tracing::warn!(kind = other.kind(), "Ignoring unexpected message");
            }
        }
        None
    }

    async fn handle_frame(&self, frame: RelayFrame, tx: &mpsc::Sender<RelayMessage>) {
        let exchange_id = frame.exchange_id;
        match frame.frame_type {
            FrameType::Open => {
                let target = match self.tunnels.get(&frame.tunnel_id) {
                    Some(tunnel) => tunnel.local_target.clone(),
                    None => {
                        tracing::warn!(
                            exchange_id,
                            tunnel_id = %frame.tunnel_id,
                            "Open for a tunnel this agent does not serve"
                        );
                        let _ = tx
                            .send(RelayMessage::Frame(RelayFrame::error(
                                exchange_id,
                                frame.tunnel_id,
                                "unknown tunnel",
                            )))
                            .await;
                        return;
                    }
                };
                self.spawn_exchange(exchange_id, frame.tunnel_id, target, tx.clone());
            }
            FrameType::Data | FrameType::End => {
                let item = match frame.frame_type {
                    FrameType::Data => Inbound::Data(frame.payload),
                    _ => Inbound::End,
                };
                match self.exchanges.deliver(exchange_id, item) {
                    Delivery::Delivered => {}
                    Delivery::Unknown => {
                        tracing::debug!(exchange_id, "Dropping frame for unknown exchange");
                    }
                    Delivery::Overflowed => {
                        tracing::warn!(exchange_id, "Exchange buffer full, aborting");
                        let _ = tx
                            .send(RelayMessage::Frame(RelayFrame::error(
                                exchange_id,
                                frame.tunnel_id,
                                "agent buffer full",
                            )))
                            .await;
                    }
                }
            }
            FrameType::Error => {
                if self.exchanges.cancel(exchange_id) {
                    tracing::debug!(
                        exchange_id,
                        reason = %frame.error_reason(),
                        "Exchange cancelled by relay"
                    );
                }
            }
        }
    }

    fn spawn_exchange(
        &self,
        exchange_id: u64,
        tunnel_id: String,
        target: LocalTarget,
        tx: mpsc::Sender<RelayMessage>,
    ) {
        let (inbound, cancelled) =
            self.exchanges
                .register(exchange_id, &tunnel_id, target.clone());
        let exchanges = self.exchanges.clone();
        let forwarder = self.forwarder.clone();

        tokio::spawn(async move {
            let result = forwarder
                .forward(
                    exchange_id,
                    &tunnel_id,
                    &target,
                    inbound,
                    tx.clone(),
                    cancelled.clone(),
                )
                .await;
            // A cancelled exchange was already removed; its id may be reused
            if !cancelled.is_cancelled() {
                exchanges.unregister(exchange_id);
            }

            match result {
                Ok(stats) => tracing::debug!(
                    exchange_id,
                    tunnel_id = %tunnel_id,
                    bytes_to_target = stats.bytes_to_target,
                    bytes_to_relay = stats.bytes_to_relay,
                    "Exchange forwarded"
                ),
                Err(ForwarderError::Cancelled) | Err(ForwarderError::RelayClosed) => {
                    tracing::debug!(exchange_id, tunnel_id = %tunnel_id, "Exchange abandoned");
                }
                Err(e) => {
                    tracing::warn!(
                        exchange_id,
                        tunnel_id = %tunnel_id,
                        error = %e,
                        "Exchange failed"
                    );
                    let _ = tx
                        .send(RelayMessage::Frame(RelayFrame::error(
                            exchange_id,
                            tunnel_id,
                            &e.to_string(),
                        )))
                        .await;
                }
            }
        });
    }
}

/// Drain the outbound queue into the connection until the session ends
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<RelayMessage>,
    closed: CancellationToken,
) where
    S: Sink<RelayMessage, Error = CodecError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(error = %e, "Failed to write to relay");
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => {
                while let Ok(msg) = outbound.try_recv() {
                    if sink.feed(msg).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// First tick one interval from now; ticks missed while busy are not replayed
fn heartbeat_ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
