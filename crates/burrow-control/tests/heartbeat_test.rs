//! Heartbeat monitor against live control connections

mod common;

use burrow_control::{AgentState, CoreEvent, RelayConfig, RelayCore, TunnelState};
use burrow_proto::{LocalTarget, RelayMessage, TunnelKind};
use common::*;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn core() -> Arc<RelayCore> {
    Arc::new(RelayCore::new(
        RelayConfig::new("relay.test")
            .with_heartbeat(Duration::from_millis(100), 3)
            .with_ack_timeout(Duration::from_secs(1)),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_agent_goes_offline_with_its_tunnels() {
    init_tracing();
    let core = core();
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());
    let mut events = core.subscribe();

    let agent = core.create_agent("user-1", "laptop").await.unwrap();
    let (mut raw, relay_side) = connect_raw(&core, &agent.token, 64 * 1024).await;

    // Acknowledge the directive, then go quiet
    let create = {
        let core = core.clone();
        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            core.create_tunnel(
                "user-1",
                &agent_id,
                "web",
                TunnelKind::Http,
                LocalTarget::new("127.0.0.1", 8080),
            )
            .await
        })
    };
    let tunnel_id = ack_next_start(&mut raw).await;
    assert_eq!(create.await.unwrap().unwrap().state, TunnelState::Active);

    // 100ms x 3 of silence
    match tokio::time::timeout(Duration::from_secs(2), raw.next()).await {
        Ok(Some(Ok(RelayMessage::Disconnect { reason }))) => {
            assert_eq!(reason, "heartbeat timeout")
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    relay_side.await.unwrap().unwrap();

    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Offline));
    assert_eq!(core.lifecycle().state(&tunnel_id), Some(TunnelState::Inactive));

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::AgentDisconnected { reason, .. } = event {
            assert_eq!(reason, "heartbeat timeout");
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeating_agent_stays_online() {
    init_tracing();
    let core = core();
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());

    let agent = core.create_agent("user-1", "laptop").await.unwrap();
    // Pings every 100ms, as announced in the welcome
    let conn = connect_agent(&core, &agent.token);
    assert!(wait_until(Duration::from_secs(2), || core.registry().is_online(&agent.id)).await);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Online));
    assert!(!conn.session.is_finished());
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_any_traffic_counts_as_heartbeat() {
    init_tracing();
    let core = core();
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());

    let agent = core.create_agent("user-1", "laptop").await.unwrap();
    let (mut raw, _relay_side) = connect_raw(&core, &agent.token, 64 * 1024).await;

    // Frames for unknown exchanges are dropped, but still prove liveness
    for _ in 0..8 {
        raw.send(RelayMessage::Frame(burrow_proto::RelayFrame::end(
            999,
            "no-such-tunnel",
        )))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(core.registry().state(&agent.id), Some(AgentState::Online));
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_agent_can_reconnect() {
    init_tracing();
    let core = core();
    let shutdown = CancellationToken::new();
    let _monitor = core.spawn_heartbeat_monitor(shutdown.clone());
    let service = echo_server().await;

    let agent = core.create_agent("user-1", "laptop").await.unwrap();
    let conn = connect_agent(&core, &agent.token);
    assert!(wait_until(Duration::from_secs(2), || core.registry().is_online(&agent.id)).await);
    let tunnel = core
        .create_tunnel("user-1", &agent.id, "web", TunnelKind::Http, service)
        .await
        .unwrap();
    assert_eq!(tunnel.state, TunnelState::Active);

    // Force the expiry path the monitor uses
    assert!(core.release(&agent.id));
    conn.session.await.unwrap().unwrap();
    assert_eq!(core.lifecycle().state(&tunnel.id), Some(TunnelState::Inactive));

    let _conn = connect_agent(&core, &agent.token);
    assert!(
        wait_until(Duration::from_secs(2), || {
            core.lifecycle().state(&tunnel.id) == Some(TunnelState::Active)
        })
        .await
    );
    let status = core.get_agent_status(&agent.id).unwrap();
    assert_eq!(status.stats.total_connections, 2);
    shutdown.cancel();
}
