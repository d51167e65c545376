//! Store laws: order-independence, durability, silent validation.

use haven_model::DeviceIdentity;
use haven_store::{
    AcceptAll, MemoryBackend, ProfileValidator, RedbBackend, ReplicatedKvStore, StoreEvent,
    UserProfile,
};
use prost::Message;
use std::sync::Arc;

fn memory_store(identity: &DeviceIdentity) -> ReplicatedKvStore {
    ReplicatedKvStore::open(
        Arc::new(MemoryBackend::new()),
        Arc::new(AcceptAll),
        identity.clone(),
    )
}

#[test]
fn replicas_converge_regardless_of_delivery_order() {
    let alice = DeviceIdentity::generate();
    let bob = DeviceIdentity::generate();

    // Two writers producing concurrent and sequential entries.
    let store_alice = memory_store(&alice);
    let store_bob = memory_store(&bob);
    store_alice.put("color", b"red".to_vec()).unwrap();
    store_alice.put("shape", b"square".to_vec()).unwrap();
    store_bob.put("color", b"blue".to_vec()).unwrap();

    let mut log: Vec<_> = store_alice.entries().unwrap();
    log.extend(store_bob.entries().unwrap());

    // Replica one receives the log forwards, replica two backwards.
    let replica_one = memory_store(&DeviceIdentity::generate());
    let replica_two = memory_store(&DeviceIdentity::generate());
    replica_one.ingest(log.clone()).unwrap();
    log.reverse();
    replica_two.ingest(log).unwrap();

    assert_eq!(
        replica_one.snapshot().unwrap(),
        replica_two.snapshot().unwrap()
    );
}

#[test]
fn persisted_store_reproduces_view_after_reopen() {
    let identity = DeviceIdentity::generate();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    let before;
    {
        let store = ReplicatedKvStore::open(
            Arc::new(RedbBackend::open(&path).unwrap()),
            Arc::new(AcceptAll),
            identity.clone(),
        );
        store.put("alpha", b"one".to_vec()).unwrap();
        store.put("beta", b"two".to_vec()).unwrap();
        store.put("alpha", b"three".to_vec()).unwrap();
        before = store.snapshot().unwrap();
    }

    let reopened = ReplicatedKvStore::open(
        Arc::new(RedbBackend::open(&path).unwrap()),
        Arc::new(AcceptAll),
        identity,
    );
    reopened.load().unwrap();
    assert_eq!(reopened.snapshot().unwrap(), before);
    assert_eq!(reopened.get("alpha").unwrap(), Some(b"three".to_vec()));
}

#[test]
fn load_emits_ready_with_full_snapshot() {
    let identity = DeviceIdentity::generate();
    let store = memory_store(&identity);
    store.put("alpha", b"one".to_vec()).unwrap();

    let mut rx = store.subscribe();
    store.load().unwrap();
    match rx.try_recv().unwrap() {
        StoreEvent::Ready { snapshot } => {
            assert_eq!(snapshot, vec![("alpha".to_string(), b"one".to_vec())]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn tampered_profile_never_surfaces_and_does_not_block_later_writes() {
    let identity = DeviceIdentity::generate();
    let store = ReplicatedKvStore::open(
        Arc::new(MemoryBackend::new()),
        Arc::new(ProfileValidator),
        identity.clone(),
    );
    let key = identity.public_key().to_hex();

    // Profile whose inner signature does not verify over its content.
    let mut tampered = UserProfile::create(&identity, "mallory", vec![]);
    tampered.sig[0] ^= 0xff;
    store.put(key.clone(), tampered.encode_to_vec()).unwrap();
    assert_eq!(store.get(&key).unwrap(), None);

    // A valid profile written afterwards goes through normally.
    let valid = UserProfile::create(&identity, "alice", vec![]);
    store.put(key.clone(), valid.encode_to_vec()).unwrap();
    let stored = store.get(&key).unwrap().expect("valid profile stored");
    let decoded = UserProfile::decode(&stored[..]).unwrap();
    assert_eq!(decoded.content.unwrap().name, "alice");
}

#[test]
fn rejected_entries_stay_in_the_raw_log() {
    let identity = DeviceIdentity::generate();
    let store = ReplicatedKvStore::open(
        Arc::new(MemoryBackend::new()),
        Arc::new(ProfileValidator),
        identity.clone(),
    );
    let key = identity.public_key().to_hex();

    let mut tampered = UserProfile::create(&identity, "mallory", vec![]);
    tampered.sig[0] ^= 0xff;
    store.put(key.clone(), tampered.encode_to_vec()).unwrap();

    // Excluded from the view, still exported for replication.
    assert_eq!(store.get(&key).unwrap(), None);
    assert_eq!(store.entries().unwrap().len(), 1);
}

#[test]
fn replicated_event_carries_affected_keys() {
    let alice = DeviceIdentity::generate();
    let store_alice = memory_store(&alice);
    store_alice.put("alpha", b"one".to_vec()).unwrap();

    let replica = memory_store(&DeviceIdentity::generate());
    let mut rx = replica.subscribe();
    replica.ingest(store_alice.entries().unwrap()).unwrap();

    match rx.try_recv().unwrap() {
        StoreEvent::Replicated { affected } => {
            assert_eq!(affected, vec![("alpha".to_string(), b"one".to_vec())]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
