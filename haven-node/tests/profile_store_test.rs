//! The profile dataset opened through the node layer.

use haven_model::records::{CommunityRecord, HiddenServiceRecord, IdentityRecord};
use haven_node::{DataDir, MemoryOverlayProvider, OrchestratorBuilder};
use haven_onion::control::ControlSession;
use haven_onion::memory::MemoryControlDaemon;
use haven_onion::HiddenServiceManager;
use haven_store::UserProfile;
use prost::Message;

#[tokio::test]
async fn profile_store_round_trips_through_the_node() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = haven_net::MemoryHub::new();
    let daemon = MemoryControlDaemon::new();

    let session = ControlSession::authenticate(daemon.link("pw"), "pw")
        .await
        .expect("auth");
    let orchestrator = OrchestratorBuilder::new(
        DataDir::new(tmp.path().to_path_buf()),
        MemoryOverlayProvider::new(hub),
        HiddenServiceManager::new(session, 8080),
    )
    .build()
    .expect("build orchestrator");

    // Persist an identity the store will sign with.
    let network = orchestrator.get_network(None).await.unwrap();
    orchestrator
        .db()
        .set_community(&CommunityRecord {
            id: "c1".into(),
            peer_list: vec![],
            root_ca: None,
        })
        .unwrap();
    orchestrator
        .db()
        .set_identity(&IdentityRecord {
            community_id: "c1".into(),
            secret_key: network.identity.secret_bytes().to_vec(),
            hidden_service: Some(HiddenServiceRecord {
                address: network.hidden_service.address.to_string(),
                private_key: network.hidden_service.private_key.clone(),
            }),
            nickname: "nick".into(),
            user_csr: None,
        })
        .unwrap();

    let store = orchestrator.open_profile_store().unwrap();
    let key = network.identity.public_key().to_hex();
    let profile = UserProfile::create(&network.identity, "alice", vec![]);
    store.put(key.clone(), profile.encode_to_vec()).unwrap();

    // Reopen: the persisted view survives the round trip.
    drop(store);
    let reopened = orchestrator.open_profile_store().unwrap();
    reopened.load().unwrap();
    let stored = reopened.get(&key).unwrap().expect("profile persisted");
    let decoded = UserProfile::decode(&stored[..]).unwrap();
    assert_eq!(decoded.content.unwrap().name, "alice");
}
