//! Peer swarm
//!
//! Joins the overlay bound to the local identity, dials configured
//! peers, runs the membership handshake on every link (inbound and
//! outbound), tracks live sessions, and emits connect/disconnect events
//! exactly once per logical transition.
//!
//! Sessions coalesce: multiple links to the same peer (dial races,
//! disconnect-then-reconnect overlap) share one session record, so
//! consumers never see duplicate transitions for one peer.

use crate::framing::{FrameSink, FrameStream};
use crate::overlay::{Link, LinkStream, Overlay, OverlayError};
use haven_model::types::PubKey;
use haven_model::{Clock, NetworkKey, PeerAddress, PeerEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on graceful close during `stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Membership proof exchanged on every new link.
#[derive(Clone, PartialEq, prost::Message)]
struct MembershipHello {
    /// Keyed BLAKE3 of the sender's public key under the community PSK;
    /// empty on open networks.
    #[prost(bytes = "vec", tag = "1")]
    proof: Vec<u8>,
}

fn membership_proof(psk: Option<&NetworkKey>, key: &PubKey) -> Vec<u8> {
    match psk {
        Some(psk) => blake3::keyed_hash(psk.as_bytes(), key.as_bytes())
            .as_bytes()
            .to_vec(),
        None => Vec::new(),
    }
}

fn proof_acceptable(psk: Option<&NetworkKey>, remote: &PubKey, proof: &[u8]) -> bool {
    match psk {
        // A keyed community rejects handshakes lacking the matching key.
        Some(psk) => {
            let expected = blake3::keyed_hash(psk.as_bytes(), remote.as_bytes());
            proof == expected.as_bytes()
        }
        // An open community admits anyone.
        None => true,
    }
}

struct Session<O: Overlay> {
    connected_at_ms: u64,
    links: Vec<Arc<O::Link>>,
}

struct SwarmInner<O: Overlay> {
    overlay: Arc<O>,
    psk: Option<NetworkKey>,
    clock: Arc<dyn Clock>,
    events_tx: broadcast::Sender<PeerEvent>,
    sessions: Mutex<HashMap<PubKey, Session<O>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

/// The peer transport: one swarm per launched community.
pub struct PeerSwarm<O: Overlay> {
    inner: Arc<SwarmInner<O>>,
}

impl<O: Overlay> Clone for PeerSwarm<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O: Overlay> std::fmt::Debug for PeerSwarm<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSwarm")
            .field("local", &self.inner.overlay.local_key())
            .finish()
    }
}

impl<O: Overlay> PeerSwarm<O> {
    /// Join the overlay and start accepting inbound links. A supplied
    /// pre-shared key restricts membership to peers holding it.
    pub fn start(overlay: O, psk: Option<NetworkKey>, clock: Arc<dyn Clock>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let inner = Arc::new(SwarmInner {
            overlay: Arc::new(overlay),
            psk,
            clock,
            events_tx,
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        });

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                if accept_inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                let Some(link) = accept_inner.overlay.accept_link().await else {
                    break;
                };
                let inner = accept_inner.clone();
                let task = tokio::spawn(async move {
                    inner.handle_inbound(Arc::new(link)).await;
                });
                inner_push_task(&accept_inner, task);
            }
        });
        inner_push_task(&inner, accept_task);

        Self { inner }
    }

    pub fn local_key(&self) -> PubKey {
        self.inner.overlay.local_key()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn connected_peers(&self) -> Vec<PubKey> {
        self.inner
            .sessions
            .lock()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Dial every address in the list, deduplicated and self-excluded.
    /// Dials run in the background; per-peer failures are independent,
    /// non-fatal and logged. Returns the number of dials issued.
    pub fn dial(&self, peers: Vec<PeerAddress>) -> usize {
        let local = self.local_key();
        let candidates: Vec<_> = haven_model::addr::dedup_addresses(peers)
            .into_iter()
            .filter(|a| a.peer_id != local)
            .collect();

        let issued = candidates.len();
        for addr in candidates {
            let inner = self.inner.clone();
            let task = tokio::spawn(async move {
                inner.dial_one(addr).await;
            });
            inner_push_task(&self.inner, task);
        }
        issued
    }

    /// Close all connections within a bounded timeout, then force-release
    /// remaining tasks. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        // Retire every live session exactly once.
        let drained: Vec<(PubKey, Session<O>)> = self
            .inner
            .sessions
            .lock()
            .map(|mut sessions| sessions.drain().collect())
            .unwrap_or_default();
        for (peer, session) in drained {
            for link in &session.links {
                link.close();
            }
            self.inner.emit_disconnected(peer, session.connected_at_ms);
        }

        if tokio::time::timeout(STOP_TIMEOUT, self.inner.overlay.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("overlay shutdown timed out, force-releasing");
        }

        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }
}

fn inner_push_task<O: Overlay>(inner: &Arc<SwarmInner<O>>, task: JoinHandle<()>) {
    if let Ok(mut tasks) = inner.tasks.lock() {
        // Drop handles of tasks that already finished.
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl<O: Overlay> SwarmInner<O> {
    async fn dial_one(self: Arc<Self>, addr: PeerAddress) {
        let link = match self.overlay.dial_link(&addr).await {
            Ok(link) => Arc::new(link),
            Err(err) => {
                tracing::warn!(%addr, %err, "failed to dial peer");
                return;
            }
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake_outbound(&link)).await {
            Ok(Ok(())) => self.admit(link),
            Ok(Err(err)) => {
                tracing::warn!(%addr, %err, "membership handshake failed");
                link.close();
            }
            Err(_) => {
                tracing::warn!(%addr, "membership handshake timed out");
                link.close();
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, link: Arc<O::Link>) {
        let remote = link.remote_key();
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake_inbound(&link)).await {
            Ok(Ok(())) => self.admit(link),
            Ok(Err(err)) => {
                tracing::warn!(peer = ?remote, %err, "rejecting inbound link");
                link.close();
            }
            Err(_) => {
                tracing::warn!(peer = ?remote, "inbound handshake timed out");
                link.close();
            }
        }
    }

    /// Initiator side: send our proof, require a valid proof back.
    async fn handshake_outbound(&self, link: &O::Link) -> Result<(), OverlayError> {
        let stream = link.open_stream().await?;
        let (tx, rx) = stream.into_split();
        let mut sink = FrameSink::new(tx);
        let mut stream = FrameStream::new(rx);

        sink.send(&MembershipHello {
            proof: membership_proof(self.psk.as_ref(), &self.overlay.local_key()),
        })
        .await?;

        let reply: MembershipHello = stream
            .recv()
            .await?
            .ok_or(OverlayError::HandshakeRejected)?;
        if !proof_acceptable(self.psk.as_ref(), &link.remote_key(), &reply.proof) {
            return Err(OverlayError::HandshakeRejected);
        }
        Ok(())
    }

    /// Responder side: require a valid proof before answering with ours.
    async fn handshake_inbound(&self, link: &O::Link) -> Result<(), OverlayError> {
        let stream = link.accept_stream().await?;
        let (tx, rx) = stream.into_split();
        let mut sink = FrameSink::new(tx);
        let mut stream = FrameStream::new(rx);

        let hello: MembershipHello = stream
            .recv()
            .await?
            .ok_or(OverlayError::HandshakeRejected)?;
        if !proof_acceptable(self.psk.as_ref(), &link.remote_key(), &hello.proof) {
            return Err(OverlayError::HandshakeRejected);
        }

        sink.send(&MembershipHello {
            proof: membership_proof(self.psk.as_ref(), &self.overlay.local_key()),
        })
        .await?;
        Ok(())
    }

    /// Record the link and emit `Connected` if this opens a session.
    fn admit(self: &Arc<Self>, link: Arc<O::Link>) {
        if self.stopping.load(Ordering::SeqCst) {
            link.close();
            return;
        }
        let peer = link.remote_key();
        let now = self.clock.now_ms();

        let fresh = {
            let Ok(mut sessions) = self.sessions.lock() else {
                return;
            };
            match sessions.get_mut(&peer) {
                Some(session) => {
                    session.links.push(link.clone());
                    false
                }
                None => {
                    sessions.insert(
                        peer,
                        Session {
                            connected_at_ms: now,
                            links: vec![link.clone()],
                        },
                    );
                    true
                }
            }
        };

        if fresh {
            let _ = self.events_tx.send(PeerEvent::Connected {
                peer,
                timestamp_ms: now,
            });
        }

        let inner = self.clone();
        let watcher = tokio::spawn(async move {
            link.closed().await;
            inner.retire_link(peer, &link);
        });
        inner_push_task(self, watcher);
    }

    /// Drop a dead link; emit `Disconnected` when the last one goes.
    /// A retire for a peer with no live session is a no-op, so an
    /// overlapping disconnect/reconnect never produces duplicates.
    fn retire_link(&self, peer: PubKey, link: &Arc<O::Link>) {
        let closed_session = {
            let Ok(mut sessions) = self.sessions.lock() else {
                return;
            };
            let Some(session) = sessions.get_mut(&peer) else {
                return;
            };
            session.links.retain(|l| !Arc::ptr_eq(l, link));
            if session.links.is_empty() {
                sessions.remove(&peer).map(|s| s.connected_at_ms)
            } else {
                None
            }
        };

        if let Some(connected_at_ms) = closed_session {
            self.emit_disconnected(peer, connected_at_ms);
        }
    }

    fn emit_disconnected(&self, peer: PubKey, connected_at_ms: u64) {
        let now = self.clock.now_ms();
        let _ = self.events_tx.send(PeerEvent::Disconnected {
            peer,
            connection_secs: now.saturating_sub(connected_at_ms) / 1_000,
            last_seen_ms: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_network_accepts_empty_proof() {
        let remote = PubKey::new([1; 32]);
        assert!(proof_acceptable(None, &remote, &[]));
        // Open networks do not inspect proofs at all.
        assert!(proof_acceptable(None, &remote, b"anything"));
    }

    #[test]
    fn keyed_network_requires_matching_proof() {
        let psk = NetworkKey::from_bytes([7; 32]);
        let other = NetworkKey::from_bytes([8; 32]);
        let remote = PubKey::new([1; 32]);

        let good = membership_proof(Some(&psk), &remote);
        let bad = membership_proof(Some(&other), &remote);
        let empty = membership_proof(None, &remote);

        assert!(proof_acceptable(Some(&psk), &remote, &good));
        assert!(!proof_acceptable(Some(&psk), &remote, &bad));
        assert!(!proof_acceptable(Some(&psk), &remote, &empty));
    }

    #[test]
    fn proof_is_bound_to_the_sender_key() {
        let psk = NetworkKey::from_bytes([7; 32]);
        let alice = PubKey::new([1; 32]);
        let bob = PubKey::new([2; 32]);

        // A proof replayed from another peer does not verify.
        let alice_proof = membership_proof(Some(&psk), &alice);
        assert!(!proof_acceptable(Some(&psk), &bob, &alice_proof));
    }
}
