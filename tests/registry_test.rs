//! Connection sharing through the registry.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use channelmux::{ChannelRegistry, ConnectionState, ReconnectPolicy, ReleaseOutcome};
use common::{eventually, wait_for_state, TestServer};
use serde_json::json;

#[tokio::test]
async fn test_shared_address_uses_one_socket() {
    let server = TestServer::start().await;
    let registry = ChannelRegistry::new();
    let address = server.address("/ws/payments/");
    let policy = ReconnectPolicy::default();

    let a = registry.acquire(&address, &policy);
    let b = registry.acquire(&address, &policy);
    assert!(a.ptr_eq(&b));
    assert_eq!(registry.ref_count(&address), 2);

    wait_for_state(&mut a.watch_state(), ConnectionState::is_open).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);

    // Both consumers see every envelope from the single socket.
    let seen = Arc::new(Mutex::new(0));
    for conn in [&a, &b] {
        let seen = Arc::clone(&seen);
        conn.add_listener(move |_| *seen.lock().unwrap() += 1);
    }
    server.push_json(&json!({"type": "payment_event"}));
    eventually("fan-out", || *seen.lock().unwrap() == 2).await;

    assert_eq!(
        registry.release(&address),
        ReleaseOutcome::Released { remaining: 1 }
    );
    assert!(b.is_open());
    assert_eq!(registry.release(&address), ReleaseOutcome::Closed);
    assert_eq!(registry.release(&address), ReleaseOutcome::Unknown);

    eventually("socket closed", || server.active() == 0).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_concurrent_acquires_open_once() {
    let server = TestServer::start().await;
    let registry = ChannelRegistry::new();
    let address = server.address("/ws/users/");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            let address = address.clone();
            tokio::spawn(async move { registry.acquire(&address, &ReconnectPolicy::default()) })
        })
        .collect();
    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await.unwrap());
    }

    assert!(connections.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    assert_eq!(registry.ref_count(&address), 16);
    wait_for_state(&mut connections[0].watch_state(), ConnectionState::is_open).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);

    registry.close_all();
    eventually("socket closed", || server.active() == 0).await;
}

#[tokio::test]
async fn test_reacquire_after_close_opens_fresh_connection() {
    let server = TestServer::start().await;
    let registry = ChannelRegistry::new();
    let address = server.address("/ws/chat/1/");
    let policy = ReconnectPolicy::default();

    let first = registry.acquire(&address, &policy);
    wait_for_state(&mut first.watch_state(), ConnectionState::is_open).await;
    assert_eq!(registry.release(&address), ReleaseOutcome::Closed);
    assert!(first.is_closed());

    let second = registry.acquire(&address, &policy);
    assert!(!second.ptr_eq(&first));
    wait_for_state(&mut second.watch_state(), ConnectionState::is_open).await;
    eventually("second socket", || server.accepted() == 2).await;
    registry.close_all();
}
