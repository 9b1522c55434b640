//! Concurrency tests for the subdomain router
//!
//! These tests verify:
//! 1. Exactly one tunnel wins a contested subdomain
//! 2. Candidate retry gives every tunnel a distinct subdomain under a storm
//! 3. Readers never observe a half-published route

use burrow_proto::{LocalTarget, TunnelKind};
use burrow_router::{RouteError, SubdomainCandidates, SubdomainRouter, TunnelRoute};
use std::collections::HashSet;
use std::sync::Arc;

fn route(tunnel_id: &str, subdomain: &str) -> TunnelRoute {
    TunnelRoute {
        tunnel_id: tunnel_id.to_string(),
        agent_id: "agent-1".to_string(),
        subdomain: subdomain.to_string(),
        kind: TunnelKind::Http,
        local_target: LocalTarget::new("127.0.0.1", 8080),
    }
}

#[test]
fn test_single_winner_for_contested_subdomain() {
    let router = Arc::new(SubdomainRouter::new());

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let router = router.clone();
            std::thread::spawn(move || router.publish(route(&format!("tun-{}", i), "web")))
        })
        .collect();

    let results: Vec<Result<(), RouteError>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one tunnel should claim the subdomain");
    assert_eq!(router.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_candidate_retry_storm_assigns_unique_subdomains() {
    let router = Arc::new(SubdomainRouter::new());

    let mut handles = vec![];
    for i in 0..50 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            let tunnel_id = format!("tun-{}", i);
            for candidate in SubdomainCandidates::new("web", 100) {
                match router.publish(route(&tunnel_id, &candidate)) {
                    Ok(()) => return Some(candidate),
                    Err(RouteError::DuplicateSubdomain { .. }) => continue,
                    Err(other) => panic!("unexpected error: {}", other),
                }
            }
            None
        }));
    }

    let mut assigned = HashSet::new();
    for handle in handles {
        let subdomain = handle.await.unwrap().expect("candidate space exhausted");
        assert!(assigned.insert(subdomain), "subdomain assigned twice");
    }

    assert_eq!(assigned.len(), 50);
    assert_eq!(router.len(), 50);
}

#[test]
fn test_readers_see_whole_routes_during_churn() {
    let router = Arc::new(SubdomainRouter::new());
    router.publish(route("tun-stable", "stable")).unwrap();

    let writer = {
        let router = router.clone();
        std::thread::spawn(move || {
            for i in 0..2_000 {
                let tunnel_id = format!("tun-{}", i % 8);
                let subdomain = format!("churn{}", i % 8);
                let _ = router.publish(route(&tunnel_id, &subdomain));
                router.unpublish(&tunnel_id);
            }
        })
    };

    let reader = {
        let router = router.clone();
        std::thread::spawn(move || {
            for i in 0..2_000 {
                // Unrelated subdomain is always resolvable
                assert_eq!(router.resolve("stable").unwrap().tunnel_id, "tun-stable");

                if let Ok(found) = router.resolve(&format!("churn{}", i % 8)) {
                    assert_eq!(found.tunnel_id, format!("tun-{}", i % 8));
                    assert_eq!(found.subdomain, format!("churn{}", i % 8));
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(router.len(), 1);
}
