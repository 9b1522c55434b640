//! Sessions of agents that stopped reading must still end when the relay
//! lets go of them, and policy changes must reach agents that still read

mod common;

use bytes::Bytes;
use burrow_control::{
    AgentState, ExchangeStream, HeartbeatPolicy, RelayConfig, RelayCore, RelayResult, TunnelState,
};
use burrow_proto::{LocalTarget, TunnelKind};
use common::*;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const SESSION_END_LIMIT: Duration = Duration::from_secs(3);

fn core(heartbeat: Duration) -> Arc<RelayCore> {
    Arc::new(RelayCore::new(
        RelayConfig::new("relay.test")
            .with_heartbeat(heartbeat, 3)
            .with_ack_timeout(Duration::from_secs(2)),
    ))
}

/// Bring up a tunnel on `raw`, then push a request the agent never reads so
/// the relay's writer blocks on the full pipe
async fn jam_writer(
    core: &Arc<RelayCore>,
    raw: &mut RawAgent,
    agent_id: &str,
) -> JoinHandle<RelayResult<ExchangeStream>> {
    let create = {
        let core = core.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            core.create_tunnel(
                "user-1",
                &agent_id,
                "stuck",
                TunnelKind::Http,
                LocalTarget::new("127.0.0.1", 8080),
            )
            .await
        })
    };
    ack_next_start(raw).await;
    assert_eq!(create.await.unwrap().unwrap().state, TunnelState::Active);

    let jammed = {
        let core = core.clone();
        tokio::spawn(async move { core.forward("stuck", Bytes::from(vec![7u8; 4096])).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    jammed
}

/// The relay side dropped the connection: whatever was buffered drains,
/// then the stream ends
async fn assert_connection_dropped(raw: &mut RawAgent) {
    let drained = timeout(SESSION_END_LIMIT, async {
        while let Some(Ok(_)) = raw.next().await {}
    })
    .await;
    assert!(drained.is_ok(), "relay kept the connection open");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_released_agent_with_full_pipe_is_dropped() {
    init_tracing();
    let core = core(Duration::from_secs(30));
    let agent = core.create_agent("user-1", "stalled").await.unwrap();
    let (mut raw, relay_side) = connect_raw(&core, &agent.token, 16).await;
    let _jammed = jam_writer(&core, &mut raw, &agent.id).await;

    assert!(core.release(&agent.id));
    let ended = timeout(SESSION_END_LIMIT, relay_side).await;
    assert!(ended.is_ok(), "session of a stalled agent never ended");
    ended.unwrap().unwrap().unwrap();

    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Offline));
    assert_connection_dropped(&mut raw).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replaced_stalled_connection_is_dropped() {
    init_tracing();
    let core = core(Duration::from_secs(30));
    let agent = core.create_agent("user-1", "stalled").await.unwrap();
    let (mut stalled, old_side) = connect_raw(&core, &agent.token, 16).await;
    let _jammed = jam_writer(&core, &mut stalled, &agent.id).await;

    let (_fresh, _new_side) = connect_raw(&core, &agent.token, 64 * 1024).await;
    let ended = timeout(SESSION_END_LIMIT, old_side).await;
    assert!(ended.is_ok(), "replaced session never ended");

    // The newer connection keeps the agent online
    assert!(core.registry().is_online(&agent.id));
    assert_connection_dropped(&mut stalled).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_stalled_agent_is_dropped() {
    init_tracing();
    let core = core(Duration::from_millis(100));
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());

    let agent = core.create_agent("user-1", "stalled").await.unwrap();
    let (mut raw, relay_side) = connect_raw(&core, &agent.token, 16).await;
    let _jammed = jam_writer(&core, &mut raw, &agent.id).await;

    // Silent for 100ms x 3, then at most one flush timeout to let go
    let ended = timeout(SESSION_END_LIMIT, relay_side).await;
    assert!(ended.is_ok(), "expired session never ended");
    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Offline));
    assert_connection_dropped(&mut raw).await;
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tightened_policy_keeps_heartbeating_agent_online() {
    init_tracing();
    // Welcomed with a 2s interval; the override below expires it in 400ms
    // unless the agent learns about it
    let core = core(Duration::from_secs(2));
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());

    let agent = core.create_agent("user-1", "laptop").await.unwrap();
    let conn = connect_agent(&core, &agent.token);
    assert!(wait_until(Duration::from_secs(2), || core.registry().is_online(&agent.id)).await);

    core.update_agent_config(&agent.id, HeartbeatPolicy::new(Duration::from_millis(200), 2))
        .unwrap();

    // Several sweeps at the 200ms period
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Online));
    assert!(!conn.session.is_finished());
    assert!(!conn.relay_side.is_finished());
    let status = core.get_agent_status(&agent.id).unwrap();
    assert_eq!(status.stats.total_connections, 1);
    assert_eq!(status.heartbeat.interval, Duration::from_millis(200));

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tightened_policy_still_expires_silent_agent() {
    init_tracing();
    let core = core(Duration::from_secs(30));
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());

    let agent = core.create_agent("user-1", "quiet").await.unwrap();
    let (_raw, relay_side) = connect_raw(&core, &agent.token, 64 * 1024).await;

    // The default sweep runs every 10s; the override must not wait for it
    core.update_agent_config(&agent.id, HeartbeatPolicy::new(Duration::from_millis(100), 2))
        .unwrap();
    let ended = timeout(SESSION_END_LIMIT, relay_side).await;
    assert!(ended.is_ok(), "silent agent outlived its policy");
    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Offline));
    shutdown.cancel();
}
