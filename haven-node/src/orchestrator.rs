//! Network lifecycle orchestration
//!
//! Boot-time recovery, single-flight community launches, peer-stat
//! persistence and graceful teardown. The expensive provisioning
//! sequence (hidden service, overlay, dials) runs at most once per
//! community id per live process; concurrent launch requests for the
//! same id collapse onto the in-flight attempt.

use crate::data_dir::DataDir;
use crate::local_db::{LocalDb, LocalDbError};
use haven_model::records::{CommunityRecord, HiddenServiceRecord, IdentityRecord};
use haven_model::types::PubKey;
use haven_model::{
    Clock, DeviceIdentity, IdentityError, OnionAddress, OnionError, PeerAddress, PeerEvent,
    SystemClock,
};
use haven_net::overlay::{Overlay, OverlayError};
use haven_net::swarm::PeerSwarm;
use haven_onion::control::ControlLink;
use haven_onion::manager::{HiddenService, HiddenServiceError, HiddenServiceManager};
use haven_store::{ProfileValidator, RedbBackend, ReplicatedKvStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("persistence error: {0}")]
    Persistence(#[from] LocalDbError),

    #[error("provisioning error: {0}")]
    Provisioning(#[from] HiddenServiceError),

    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("invalid persisted onion address: {0}")]
    Onion(#[from] OnionError),

    #[error("store error: {0}")]
    Store(#[from] haven_store::BackendError),

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Binds an overlay endpoint to an identity. The seam that picks the
/// production iroh endpoint or the in-memory overlay.
pub trait OverlayProvider: Send + Sync + 'static {
    type Overlay: Overlay;

    fn bind(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<Self::Overlay, OverlayError>> + Send;
}

/// A freshly allocated or restored network identity.
#[derive(Clone)]
pub struct NetworkIdentity {
    pub identity: DeviceIdentity,
    pub hidden_service: HiddenService,
}

impl NetworkIdentity {
    /// The local multiaddress other peers dial.
    pub fn local_address(&self) -> PeerAddress {
        PeerAddress::new(
            self.hidden_service.address.clone(),
            self.identity.public_key(),
        )
    }
}

/// Everything `launch_community` needs.
pub struct LaunchPayload {
    pub community: CommunityRecord,
    pub network: NetworkIdentity,
    pub nickname: String,
}

enum LaunchState {
    Launching(watch::Receiver<Option<Result<(), String>>>),
    Launched,
}

struct RunningCommunity<O: Overlay> {
    swarm: PeerSwarm<O>,
    onion_address: OnionAddress,
    event_task: JoinHandle<()>,
}

/// Top-level coordinator for the networking stack of one process.
pub struct NetworkOrchestrator<P: OverlayProvider, L: ControlLink> {
    data_dir: DataDir,
    db: Arc<LocalDb>,
    onion: Arc<HiddenServiceManager<L>>,
    provider: P,
    clock: Arc<dyn Clock>,
    launches: Mutex<HashMap<String, LaunchState>>,
    running: tokio::sync::Mutex<HashMap<String, RunningCommunity<P::Overlay>>>,
    events_tx: broadcast::Sender<PeerEvent>,
}

/// Builder collecting all collaborators before construction.
pub struct OrchestratorBuilder<P: OverlayProvider, L: ControlLink> {
    data_dir: DataDir,
    provider: P,
    onion: HiddenServiceManager<L>,
    clock: Arc<dyn Clock>,
}

impl<P: OverlayProvider, L: ControlLink> OrchestratorBuilder<P, L> {
    pub fn new(data_dir: DataDir, provider: P, onion: HiddenServiceManager<L>) -> Self {
        Self {
            data_dir,
            provider,
            onion,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<NetworkOrchestrator<P, L>, OrchestratorError> {
        self.data_dir
            .ensure_dirs()
            .map_err(|e| OrchestratorError::LaunchFailed(format!("data dir: {e}")))?;
        let db = Arc::new(LocalDb::open(self.data_dir.local_db())?);
        let (events_tx, _) = broadcast::channel(256);
        Ok(NetworkOrchestrator {
            data_dir: self.data_dir,
            db,
            onion: Arc::new(self.onion),
            provider: self.provider,
            clock: self.clock,
            launches: Mutex::new(HashMap::new()),
            running: tokio::sync::Mutex::new(HashMap::new()),
            events_tx,
        })
    }
}

impl<P: OverlayProvider, L: ControlLink + 'static> NetworkOrchestrator<P, L> {
    /// Recovery state, for community creation/join flows and tests.
    pub fn db(&self) -> &Arc<LocalDb> {
        &self.db
    }

    /// Forwarded connectivity events for external consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_launched(&self, community_id: &str) -> bool {
        self.launches
            .lock()
            .map(|l| matches!(l.get(community_id), Some(LaunchState::Launched)))
            .unwrap_or(false)
    }

    /// Boot-time auto-resume: if a current community with its record and
    /// identity is fully persisted, relaunch it; otherwise do nothing.
    /// A dangling `currentCommunityId` is tolerated, not an error.
    pub async fn init(&self) -> Result<Option<String>, OrchestratorError> {
        let Some(payload) = self.resume_payload()? else {
            return Ok(None);
        };
        let community_id = payload.community.id.clone();
        self.launch_community(payload).await?;
        Ok(Some(community_id))
    }

    /// Assemble the launch payload from persisted state, or `None` when
    /// any piece is missing.
    fn resume_payload(&self) -> Result<Option<LaunchPayload>, OrchestratorError> {
        let Some(community_id) = self.db.current_community_id()? else {
            return Ok(None);
        };
        let Some(community) = self.db.community()? else {
            tracing::warn!(
                %community_id,
                "current community pointer is dangling, skipping auto-resume"
            );
            return Ok(None);
        };
        if community.id != community_id {
            tracing::warn!(
                %community_id,
                stored = %community.id,
                "current community pointer does not match stored record, skipping auto-resume"
            );
            return Ok(None);
        }
        let Some(identity_record) = self.db.identity()? else {
            return Ok(None);
        };
        let network = network_identity_from_record(&identity_record)?;

        // Local address first; the persisted list keeps its order,
        // deduplicated.
        let mut peer_list = vec![network.local_address().to_string()];
        peer_list.extend(community.peer_list.iter().cloned());
        let mut seen = std::collections::HashSet::new();
        peer_list.retain(|addr| seen.insert(addr.clone()));

        Ok(Some(LaunchPayload {
            community: CommunityRecord {
                peer_list,
                ..community
            },
            network,
            nickname: identity_record.nickname,
        }))
    }

    /// Launch a community, single-flight per community id. Callers that
    /// find an attempt in flight await its outcome; callers that find it
    /// launched return immediately. A failed attempt resets the state so
    /// the launch can be retried.
    pub async fn launch_community(&self, payload: LaunchPayload) -> Result<(), OrchestratorError> {
        let community_id = payload.community.id.clone();

        let done_tx = {
            let mut launches = self
                .launches
                .lock()
                .map_err(|_| OrchestratorError::LockPoisoned)?;
            match launches.get(&community_id) {
                Some(LaunchState::Launched) => return Ok(()),
                Some(LaunchState::Launching(rx)) => {
                    let mut rx = rx.clone();
                    drop(launches);
                    let outcome = rx
                        .wait_for(|outcome| outcome.is_some())
                        .await
                        .map_err(|_| {
                            OrchestratorError::LaunchFailed("launch attempt aborted".into())
                        })?
                        .clone();
                    return match outcome {
                        Some(Ok(())) => Ok(()),
                        Some(Err(message)) => Err(OrchestratorError::LaunchFailed(message)),
                        None => unreachable!("wait_for yields only resolved outcomes"),
                    };
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    launches.insert(community_id.clone(), LaunchState::Launching(rx));
                    tx
                }
            }
        };

        let result = self.launch(payload).await;

        {
            let mut launches = self
                .launches
                .lock()
                .map_err(|_| OrchestratorError::LockPoisoned)?;
            match &result {
                Ok(()) => {
                    launches.insert(community_id.clone(), LaunchState::Launched);
                }
                Err(err) => {
                    tracing::warn!(%community_id, %err, "community launch failed");
                    launches.remove(&community_id);
                }
            }
        }
        let _ = done_tx.send(Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string())));
        result
    }

    /// The provisioning sequence proper. Runs at most once per id per
    /// live process (unless reset by failure or teardown).
    async fn launch(&self, payload: LaunchPayload) -> Result<(), OrchestratorError> {
        let community_id = payload.community.id.clone();
        tracing::info!(%community_id, "launching community");

        // Persist records before the pointer so a crash never leaves
        // the pointer dangling.
        self.db.set_community(&payload.community)?;
        self.db
            .set_identity(&identity_record_from_network(&payload, &community_id))?;
        self.db.set_current_community_id(&community_id)?;

        // Re-provision the hidden service from its stored key; the
        // address comes out identical.
        let hidden_service = self
            .onion
            .create_hidden_service(Some(&payload.network.hidden_service.private_key))
            .await?;

        let psk = self.db.psk()?;
        let overlay = self.provider.bind(&payload.network.identity).await?;
        let swarm = PeerSwarm::start(overlay, psk, self.clock.clone());

        // Dial everything except ourselves; per-peer failures are the
        // swarm's to log. The list order is a priority hint, so dials
        // go out most-recently-seen first.
        let mut dial_list = Vec::new();
        let mut addr_by_peer: HashMap<PubKey, String> = HashMap::new();
        for raw in self
            .db
            .peer_list_sorted_by_last_seen(&payload.community)?
        {
            match PeerAddress::parse(&raw) {
                Ok(addr) => {
                    addr_by_peer.insert(addr.peer_id, raw.clone());
                    dial_list.push(addr);
                }
                Err(err) => {
                    tracing::warn!(address = %raw, %err, "skipping malformed peer address");
                }
            }
        }
        // Subscribe before dialing so the first connects are not missed.
        let event_task = self.spawn_event_forwarder(&swarm, addr_by_peer);
        swarm.dial(dial_list);

        self.running.lock().await.insert(
            community_id,
            RunningCommunity {
                swarm,
                onion_address: hidden_service.address,
                event_task,
            },
        );
        Ok(())
    }

    /// Persist connectivity transitions and forward them to consumers.
    /// The task is aborted on teardown so listeners never leak across
    /// relaunches.
    fn spawn_event_forwarder(
        &self,
        swarm: &PeerSwarm<P::Overlay>,
        addr_by_peer: HashMap<PubKey, String>,
    ) -> JoinHandle<()> {
        let mut events = swarm.subscribe();
        let db = self.db.clone();
        let forward_tx = self.events_tx.clone();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let peer_hex = event.peer().to_hex();
                match &event {
                    PeerEvent::Connected { peer, timestamp_ms } => {
                        if let Some(address) = addr_by_peer.get(peer) {
                            if let Err(err) =
                                db.record_peer_connected(address, &peer_hex, *timestamp_ms).await
                            {
                                tracing::warn!(%err, "failed to persist peer connect");
                            }
                        }
                    }
                    PeerEvent::Disconnected {
                        peer,
                        connection_secs,
                        last_seen_ms,
                    } => {
                        if let Some(address) = addr_by_peer.get(peer) {
                            if let Err(err) = db
                                .record_peer_disconnected(
                                    address,
                                    &peer_hex,
                                    *connection_secs,
                                    *last_seen_ms,
                                )
                                .await
                            {
                                tracing::warn!(%err, "failed to persist peer disconnect");
                            }
                        }
                    }
                }
                let _ = forward_tx.send(event);
            }
        })
    }

    /// Best-effort teardown of everything launched. Idempotent;
    /// individual failures are collected, not thrown, so teardown
    /// always completes. Resets launch state so communities can be
    /// relaunched.
    pub async fn close_all_services(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let drained: Vec<(String, RunningCommunity<P::Overlay>)> =
            self.running.lock().await.drain().collect();
        for (community_id, running) in drained {
            running.event_task.abort();
            running.swarm.stop().await;
            if let Err(err) = self
                .onion
                .destroy_hidden_service(&running.onion_address)
                .await
            {
                issues.push(format!(
                    "destroying hidden service for {community_id}: {err}"
                ));
            }
        }

        if let Ok(mut launches) = self.launches.lock() {
            launches.clear();
        }

        for issue in &issues {
            tracing::warn!(%issue, "teardown issue");
        }
        issues
    }

    /// Open the community's replicated user-profile dataset, validated
    /// by the profile payload policy and signed with the persisted
    /// identity. Independent of launch state once the transport is up.
    pub fn open_profile_store(&self) -> Result<ReplicatedKvStore, OrchestratorError> {
        let record = self
            .db
            .identity()?
            .ok_or_else(|| OrchestratorError::LaunchFailed("no persisted identity".into()))?;
        let identity = DeviceIdentity::from_secret_bytes(&record.secret_key)?;
        let backend = RedbBackend::open(self.data_dir.store_db("profiles"))?;
        Ok(ReplicatedKvStore::open(
            Arc::new(backend),
            Arc::new(ProfileValidator),
            identity,
        ))
    }

    /// Allocate a network identity: a fresh keypair plus hidden service
    /// when none is supplied. Pure allocation; persisted state is not
    /// touched. Hidden-service failure surfaces as a provisioning error.
    pub async fn get_network(
        &self,
        existing: Option<NetworkIdentity>,
    ) -> Result<NetworkIdentity, OrchestratorError> {
        if let Some(network) = existing {
            return Ok(network);
        }
        let identity = DeviceIdentity::generate();
        let hidden_service = self.onion.create_hidden_service(None).await?;
        Ok(NetworkIdentity {
            identity,
            hidden_service,
        })
    }
}

fn network_identity_from_record(
    record: &IdentityRecord,
) -> Result<NetworkIdentity, OrchestratorError> {
    let identity = DeviceIdentity::from_secret_bytes(&record.secret_key)?;
    let hs = record
        .hidden_service
        .as_ref()
        .ok_or_else(|| OrchestratorError::LaunchFailed("identity lacks hidden service".into()))?;
    Ok(NetworkIdentity {
        identity,
        hidden_service: HiddenService {
            address: OnionAddress::parse(&hs.address)?,
            private_key: hs.private_key.clone(),
        },
    })
}

fn identity_record_from_network(payload: &LaunchPayload, community_id: &str) -> IdentityRecord {
    IdentityRecord {
        community_id: community_id.to_string(),
        secret_key: payload.network.identity.secret_bytes().to_vec(),
        hidden_service: Some(HiddenServiceRecord {
            address: payload.network.hidden_service.address.to_string(),
            private_key: payload.network.hidden_service.private_key.clone(),
        }),
        nickname: payload.nickname.clone(),
        user_csr: None,
    }
}
