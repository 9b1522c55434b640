//! Shared helpers for the relay integration tests
#![allow(dead_code)]

use burrow_agent::{Agent, AgentConfig, AgentError, SessionEnd};
use burrow_control::{serve_agent_connection, RelayCore, SessionError};
use burrow_proto::{AgentMetadata, LocalTarget, RelayCodec, RelayMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A real agent connected to `core` over an in-memory pipe
pub struct ConnectedAgent {
    pub agent: Arc<Agent>,
    pub shutdown: CancellationToken,
    pub session: JoinHandle<Result<SessionEnd, AgentError>>,
    pub relay_side: JoinHandle<Result<(), SessionError>>,
}

pub fn connect_agent(core: &Arc<RelayCore>, token: &str) -> ConnectedAgent {
    let (agent_io, relay_io) = tokio::io::duplex(256 * 1024);
    let relay_side = tokio::spawn(serve_agent_connection(
        core.clone(),
        relay_io,
        "in-memory".to_string(),
    ));

    let agent = Arc::new(
        Agent::new(AgentConfig {
            relay_addr: "in-memory".to_string(),
            auth_token: token.to_string(),
            ..AgentConfig::default()
        })
        .unwrap(),
    );
    let shutdown = CancellationToken::new();
    let session = {
        let agent = agent.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run_session(agent_io, shutdown).await })
    };

    ConnectedAgent {
        agent,
        shutdown,
        session,
        relay_side,
    }
}

/// A hand-driven agent connection, for tests that need an agent misbehaving
pub type RawAgent = Framed<DuplexStream, RelayCodec>;

/// Connect and complete the handshake; `pipe_capacity` bounds the bytes in flight
pub async fn connect_raw(
    core: &Arc<RelayCore>,
    token: &str,
    pipe_capacity: usize,
) -> (RawAgent, JoinHandle<Result<(), SessionError>>) {
    let (agent_io, relay_io) = tokio::io::duplex(pipe_capacity);
    let relay_side = tokio::spawn(serve_agent_connection(
        core.clone(),
        relay_io,
        "raw".to_string(),
    ));

    let mut raw = Framed::new(agent_io, RelayCodec::new());
    raw.send(RelayMessage::Hello {
        auth_token: token.to_string(),
        metadata: AgentMetadata::default(),
    })
    .await
    .unwrap();
    match raw.next().await.unwrap().unwrap() {
        RelayMessage::Welcome { .. } => {}
        other => panic!("expected welcome, got {:?}", other),
    }
    (raw, relay_side)
}

/// Read the next start directive off `raw` and acknowledge it; returns the tunnel id
pub async fn ack_next_start(raw: &mut RawAgent) -> String {
    let (tunnel_id, generation) = match raw.next().await.unwrap().unwrap() {
        RelayMessage::StartTunnel {
            tunnel_id,
            generation,
            ..
        } => (tunnel_id, generation),
        other => panic!("expected start directive, got {:?}", other),
    };
    raw.send(RelayMessage::TunnelAck {
        tunnel_id: tunnel_id.clone(),
        generation,
    })
    .await
    .unwrap();
    tunnel_id
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// TCP service echoing everything until the client half-closes
pub async fn echo_server() -> LocalTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    LocalTarget::new("127.0.0.1", port)
}

/// Minimal HTTP service: reads a request head, answers `body`, closes
pub async fn http_server(body: &'static str) -> LocalTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    LocalTarget::new("127.0.0.1", port)
}

/// TCP service that accepts and never answers
pub async fn silent_server() -> LocalTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    LocalTarget::new("127.0.0.1", port)
}
