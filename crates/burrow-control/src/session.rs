//! Control connection session
//!
//! One task per agent control connection:
//! 1. Read `Hello` within the handshake timeout and admit the agent
//! 2. Answer with `Welcome`, then split the connection into a writer task
//!    draining the link's outbound queue and a reader loop
//! 3. The reader touches liveness on every message and dispatches frames,
//!    acknowledgments and pings
//! 4. On exit the connection is released, unless a newer one already took
//!    its place

use crate::error::RelayError;
use crate::link::AgentLink;
use crate::relay_core::RelayCore;
use burrow_proto::{CodecError, RelayCodec, RelayMessage};
use futures::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No hello received within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection closed before hello")]
    ClosedBeforeHello,

    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("Agent rejected: {0}")]
    Rejected(RelayError),
}

/// How long a closing connection may spend flushing its last messages
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

enum Flow {
    Continue,
    Disconnect,
    Violation(&'static str),
}

/// Serve one agent control connection until it closes
pub async fn serve_agent_connection<T>(
    core: Arc<RelayCore>,
    io: T,
    peer: String,
) -> Result<(), SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(io, RelayCodec::new());
    let handshake_timeout = core.config().handshake_timeout;

    let hello = match tokio::time::timeout(handshake_timeout, framed.next()).await {
        Err(_) => {
            warn!(peer = %peer, "Agent did not say hello in time");
            return Err(SessionError::HandshakeTimeout(handshake_timeout));
        }
        Ok(None) => return Err(SessionError::ClosedBeforeHello),
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(Some(Ok(msg))) => msg,
    };

    let (auth_token, metadata) = match hello {
        RelayMessage::Hello {
            auth_token,
            metadata,
        } => (auth_token, metadata),
        other => {
            let kind = other.kind();
            let _ = framed
                .send(RelayMessage::Rejected {
                    reason: "expected hello".to_string(),
                })
                .await;
            return Err(SessionError::UnexpectedMessage(kind));
        }
    };

    let agent_id = match core.registry().authenticate(&auth_token) {
        Ok(agent_id) => agent_id,
        Err(e) => return reject(framed, &peer, e).await,
    };
    let (link, outbound) =
        AgentLink::new(agent_id.clone(), peer.clone(), core.config().outbound_queue_capacity);
    let admission = match core.admit(&auth_token, &link, metadata) {
        Ok(admission) => admission,
        Err(e) => return reject(framed, &peer, e).await,
    };

    let welcome = RelayMessage::Welcome {
        agent_id: agent_id.clone(),
        heartbeat_interval_ms: admission.policy.interval.as_millis() as u64,
        max_missed: admission.policy.max_missed,
    };
    drop(admission);
    if let Err(e) = framed.send(welcome).await {
        warn!(agent_id = %agent_id, error = %e, "Failed to send welcome");
        core.release_connection(&agent_id, link.connection_id(), None);
        return Err(e.into());
    }

    let (sink, mut stream) = framed.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, link.close_token()));

    // Acknowledgments for these directives arrive through the loop below
    {
        let core = core.clone();
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            let active = core.agent_online(&agent_id).await;
            debug!(agent_id = %agent_id, active, "Agent tunnels activated");
        });
    }

    let mut result = Ok(());
    let mut failure = None;
    loop {
        tokio::select! {
            _ = link.closed() => {
                debug!(agent_id = %agent_id, "Link closed by relay");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(msg)) => {
                    core.registry().touch(&agent_id);
                    match handle_message(&core, &link, msg) {
                        Flow::Continue => {}
                        Flow::Disconnect => break,
                        Flow::Violation(kind) => {
                            warn!(agent_id = %agent_id, kind, "Protocol violation");
                            failure = Some(format!("unexpected {} message", kind));
                            result = Err(SessionError::UnexpectedMessage(kind));
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(agent_id = %agent_id, error = %e, "Control connection error");
                    failure = Some(e.to_string());
                    result = Err(e.into());
                    break;
                }
                None => {
                    info!(agent_id = %agent_id, "Agent closed control connection");
                    break;
                }
            }
        }
    }

    let reason = failure
        .clone()
        .unwrap_or_else(|| "connection closed".to_string());
    core.release_connection(&agent_id, link.connection_id(), failure);
    // No-op when release_connection or a newer connection already closed it
    link.close(&reason);

    let stopped = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT * 2, &mut writer).await;
    match stopped {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(agent_id = %agent_id, error = %e, "Writer task ended abnormally"),
        Err(_) => {
            warn!(agent_id = %agent_id, "Writer task did not stop, aborting it");
            writer.abort();
        }
    }
    result
}

async fn reject<T>(
    mut framed: Framed<T, RelayCodec>,
    peer: &str,
    err: RelayError,
) -> Result<(), SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    warn!(peer = %peer, error = %err, "Rejected agent connection");
    let _ = framed
        .send(RelayMessage::Rejected {
            reason: err.to_string(),
        })
        .await;
    Err(SessionError::Rejected(err))
}

fn handle_message(core: &RelayCore, link: &AgentLink, msg: RelayMessage) -> Flow {
    match msg {
        RelayMessage::Ping { timestamp } => {
            if let Err(e) = link.try_send(RelayMessage::Pong { timestamp }) {
                debug!(agent_id = %link.agent_id(), error = %e, "Skipped pong");
            }
        }
        RelayMessage::Pong { .. } => {}
        RelayMessage::Frame(frame) => {
            core.multiplexer().dispatch(link, frame);
        }
        RelayMessage::TunnelAck {
            tunnel_id,
            generation,
        } => {
            link.resolve_ack(&tunnel_id, generation, Ok(()));
        }
        RelayMessage::TunnelNack {
            tunnel_id,
            generation,
            reason,
        } => {
            warn!(agent_id = %link.agent_id(), tunnel_id = %tunnel_id, reason = %reason, "Agent refused tunnel");
            link.resolve_ack(&tunnel_id, generation, Err(reason));
        }
        RelayMessage::Disconnect { reason } => {
            info!(agent_id = %link.agent_id(), reason = %reason, "Agent disconnecting");
            return Flow::Disconnect;
        }
        other => return Flow::Violation(other.kind()),
    }
    Flow::Continue
}

/// Drain the outbound queue into the connection. Once the link is closed,
/// whatever is still queued (typically a `Disconnect`) is flushed and the
/// connection is shut down.
///
/// A pending write never outlives the close: an agent that stopped reading
/// only gets `CLOSE_FLUSH_TIMEOUT` to take the final messages.
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
                    tokio::select! {
                        sent = sink.send(msg) => {
                            if let Err(e) = sent {
                                warn!(error = %e, "Failed to write to control connection");
                                closed.cancel();
                                return;
                            }
                        }
                        // A frame cut short here stays buffered in the codec
                        _ = closed.cancelled() => break,
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }

    let flush = async {
        while let Ok(msg) = outbound.try_recv() {
            sink.feed(msg).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Control connection closed while flushing"),
        Err(_) => debug!("Agent stopped reading, dropping control connection unflushed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::model::{AgentState, TunnelState};
    use burrow_proto::{AgentMetadata, LocalTarget, TunnelKind};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    type Client = Framed<DuplexStream, RelayCodec>;

    fn core() -> Arc<RelayCore> {
        Arc::new(RelayCore::new(
            RelayConfig::new("relay.test").with_ack_timeout(Duration::from_secs(2)),
        ))
    }

    fn start(core: &Arc<RelayCore>) -> (Client, JoinHandle<Result<(), SessionError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(serve_agent_connection(
            core.clone(),
            server,
            "test-peer".to_string(),
        ));
        (Framed::new(client, RelayCodec::new()), session)
    }

    async fn hello(client: &mut Client, token: &str) -> RelayMessage {
        client
            .send(RelayMessage::Hello {
                auth_token: token.to_string(),
                metadata: AgentMetadata::default(),
            })
            .await
            .unwrap();
        client.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_welcome_and_release_on_close() {
        let core = core();
        let agent = core.create_agent("user-1", "laptop").await.unwrap();
        let (mut client, session) = start(&core);

        match hello(&mut client, &agent.token).await {
            RelayMessage::Welcome {
                agent_id,
                heartbeat_interval_ms,
                max_missed,
            } => {
                assert_eq!(agent_id, agent.id);
                assert_eq!(heartbeat_interval_ms, 30_000);
                assert_eq!(max_missed, 3);
            }
            other => panic!("expected welcome, got {:?}", other),
        }
        assert!(core.registry().is_online(&agent.id));

        drop(client);
        session.await.unwrap().unwrap();
        assert_eq!(core.registry().state(&agent.id), Some(AgentState::Offline));
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let core = core();
        let (mut client, session) = start(&core);

        match hello(&mut client, "nope").await {
            RelayMessage::Rejected { reason } => assert!(reason.contains("token")),
            other => panic!("expected rejection, got {:?}", other),
        }
        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Rejected(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_first_message_must_be_hello() {
        let core = core();
        let (mut client, session) = start(&core);

        client
            .send(RelayMessage::Ping { timestamp: 1 })
            .await
            .unwrap();
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            RelayMessage::Rejected { .. }
        ));
        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedMessage("ping")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let core = core();
        let (_client, session) = start(&core);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let core = core();
        let agent = core.create_agent("user-1", "laptop").await.unwrap();
        let (mut client, _session) = start(&core);
        hello(&mut client, &agent.token).await;

        client
            .send(RelayMessage::Ping { timestamp: 42 })
            .await
            .unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            RelayMessage::Pong { timestamp: 42 }
        );
    }

    #[tokio::test]
    async fn test_pending_tunnel_starts_after_ack() {
        let core = core();
        let agent = core.create_agent("user-1", "laptop").await.unwrap();
        let tunnel = core
            .create_tunnel(
                "user-1",
                &agent.id,
                "web",
                TunnelKind::Http,
                LocalTarget::new("127.0.0.1", 3000),
            )
            .await
            .unwrap();
        assert_eq!(tunnel.state, TunnelState::Requested);

        let (mut client, _session) = start(&core);
        hello(&mut client, &agent.token).await;

        let (tunnel_id, generation) = match client.next().await.unwrap().unwrap() {
            RelayMessage::StartTunnel {
                tunnel_id,
                generation,
                subdomain,
                ..
            } => {
                assert_eq!(subdomain, "web");
                (tunnel_id, generation)
            }
            other => panic!("expected start directive, got {:?}", other),
        };
        client
            .send(RelayMessage::TunnelAck {
                tunnel_id: tunnel_id.clone(),
                generation,
            })
            .await
            .unwrap();

        for _ in 0..100 {
            if core.lifecycle().state(&tunnel_id) == Some(TunnelState::Active) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel never became active");
    }

    #[tokio::test]
    async fn test_relay_release_sends_disconnect() {
        let core = core();
        let agent = core.create_agent("user-1", "laptop").await.unwrap();
        let (mut client, session) = start(&core);
        hello(&mut client, &agent.token).await;

        assert!(core.release(&agent.id));
        loop {
            match client.next().await {
                Some(Ok(RelayMessage::Disconnect { .. })) => break,
                Some(Ok(_)) => continue,
                other => panic!("expected disconnect, got {:?}", other),
            }
        }
        session.await.unwrap().unwrap();
    }
}
