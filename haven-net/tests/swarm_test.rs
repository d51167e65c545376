//! Swarm behavior over the in-memory overlay.

use haven_model::types::PubKey;
use haven_model::{MockClock, NetworkKey, OnionAddress, PeerAddress, PeerEvent};
use haven_net::{MemoryHub, MemoryOverlay, PeerSwarm};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn addr_for(key: PubKey) -> PeerAddress {
    PeerAddress::new(OnionAddress::from_public_key(&key), key)
}

fn swarm(
    hub: &MemoryHub,
    key: [u8; 32],
    psk: Option<NetworkKey>,
    clock: Arc<MockClock>,
) -> PeerSwarm<MemoryOverlay> {
    PeerSwarm::start(hub.bind(PubKey::new(key)), psk, clock)
}

async fn next_event(rx: &mut broadcast::Receiver<PeerEvent>) -> PeerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event expected")
        .expect("channel open")
}

async fn expect_silence(rx: &mut broadcast::Receiver<PeerEvent>) {
    let result = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(result.is_err(), "unexpected event: {result:?}");
}

#[tokio::test]
async fn dial_connects_both_sides_exactly_once() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(10_000));
    let a = swarm(&hub, [1; 32], None, clock.clone());
    let b = swarm(&hub, [2; 32], None, clock.clone());

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    // Duplicates and the local address are filtered before dialing.
    let issued = a.dial(vec![
        addr_for(b.local_key()),
        addr_for(b.local_key()),
        addr_for(a.local_key()),
    ]);
    assert_eq!(issued, 1);

    match next_event(&mut a_events).await {
        PeerEvent::Connected { peer, timestamp_ms } => {
            assert_eq!(peer, b.local_key());
            assert_eq!(timestamp_ms, 10_000);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut b_events).await {
        PeerEvent::Connected { peer, .. } => assert_eq!(peer, a.local_key()),
        other => panic!("unexpected event: {other:?}"),
    }

    expect_silence(&mut a_events).await;
    assert_eq!(a.connected_peers(), vec![b.local_key()]);
}

#[tokio::test]
async fn matching_psk_admits_peer() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(0));
    let psk = NetworkKey::from_bytes([9; 32]);
    let a = swarm(&hub, [1; 32], Some(psk.clone()), clock.clone());
    let b = swarm(&hub, [2; 32], Some(psk), clock.clone());

    let mut b_events = b.subscribe();
    a.dial(vec![addr_for(b.local_key())]);

    match next_event(&mut b_events).await {
        PeerEvent::Connected { peer, .. } => assert_eq!(peer, a.local_key()),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_psk_is_rejected() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(0));
    let a = swarm(
        &hub,
        [1; 32],
        Some(NetworkKey::from_bytes([1; 32])),
        clock.clone(),
    );
    let b = swarm(
        &hub,
        [2; 32],
        Some(NetworkKey::from_bytes([2; 32])),
        clock.clone(),
    );

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    a.dial(vec![addr_for(b.local_key())]);

    expect_silence(&mut a_events).await;
    expect_silence(&mut b_events).await;
    assert!(a.connected_peers().is_empty());
    assert!(b.connected_peers().is_empty());
}

#[tokio::test]
async fn peer_without_psk_is_rejected_by_keyed_network() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(0));
    let open = swarm(&hub, [1; 32], None, clock.clone());
    let keyed = swarm(
        &hub,
        [2; 32],
        Some(NetworkKey::from_bytes([5; 32])),
        clock.clone(),
    );

    let mut keyed_events = keyed.subscribe();
    open.dial(vec![addr_for(keyed.local_key())]);

    expect_silence(&mut keyed_events).await;
    assert!(keyed.connected_peers().is_empty());
}

#[tokio::test]
async fn dial_failures_are_independent_and_nonfatal() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(0));
    let a = swarm(&hub, [1; 32], None, clock.clone());
    let b = swarm(&hub, [2; 32], None, clock.clone());

    let mut a_events = a.subscribe();
    // One unreachable peer, one live one: the bad dial must not take the
    // good one down with it.
    let issued = a.dial(vec![
        addr_for(PubKey::new([9; 32])),
        addr_for(b.local_key()),
    ]);
    assert_eq!(issued, 2);

    match next_event(&mut a_events).await {
        PeerEvent::Connected { peer, .. } => assert_eq!(peer, b.local_key()),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn severed_link_emits_disconnected_once_with_duration() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(1_000));
    let a = swarm(&hub, [1; 32], None, clock.clone());
    let b = swarm(&hub, [2; 32], None, clock.clone());

    let mut a_events = a.subscribe();
    a.dial(vec![addr_for(b.local_key())]);
    assert!(matches!(
        next_event(&mut a_events).await,
        PeerEvent::Connected { .. }
    ));

    clock.advance_ms(5_000);
    hub.sever_peer(b.local_key());

    match next_event(&mut a_events).await {
        PeerEvent::Disconnected {
            peer,
            connection_secs,
            last_seen_ms,
        } => {
            assert_eq!(peer, b.local_key());
            assert_eq!(connection_secs, 5);
            assert_eq!(last_seen_ms, 6_000);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Severing again: no live session, no duplicate event.
    hub.sever_peer(b.local_key());
    expect_silence(&mut a_events).await;
    assert!(a.connected_peers().is_empty());
}

#[tokio::test]
async fn stop_retires_sessions_and_is_idempotent() {
    let hub = MemoryHub::new();
    let clock = Arc::new(MockClock::new(0));
    let a = swarm(&hub, [1; 32], None, clock.clone());
    let b = swarm(&hub, [2; 32], None, clock.clone());

    let mut a_events = a.subscribe();
    a.dial(vec![addr_for(b.local_key())]);
    assert!(matches!(
        next_event(&mut a_events).await,
        PeerEvent::Connected { .. }
    ));

    a.stop().await;
    assert!(matches!(
        next_event(&mut a_events).await,
        PeerEvent::Disconnected { .. }
    ));
    assert!(a.connected_peers().is_empty());

    // Second stop is a no-op.
    a.stop().await;
    expect_silence(&mut a_events).await;
}
