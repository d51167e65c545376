//! In-memory overlay
//!
//! Routes links between endpoints through a shared hub over
//! `tokio::io::DuplexStream` pairs. Behaviorally equivalent to the real
//! overlay for swarm and orchestrator tests, plus fault injection:
//! the hub can sever all links of a peer to simulate disconnects.

use crate::overlay::{Link, LinkStream, Overlay, OverlayError};
use haven_model::types::PubKey;
use haven_model::PeerAddress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

/// Shared close state of one link; both halves hold it.
#[derive(Default)]
struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    fn trigger(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        // Register before checking so a concurrent trigger is not lost.
        let notified = self.notify.notified();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<PubKey, mpsc::Sender<MemoryLink>>,
    links: Vec<(PubKey, PubKey, Arc<CloseSignal>)>,
}

/// Shared broker routing links between in-memory endpoints.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new endpoint for `key`.
    pub fn bind(&self, key: PubKey) -> MemoryOverlay {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        if let Ok(mut inner) = self.inner.lock() {
            inner.endpoints.insert(key, accept_tx);
        }
        MemoryOverlay {
            local: key,
            hub: self.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shut: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sever every link that involves `peer` (simulated crash).
    pub fn sever_peer(&self, peer: PubKey) {
        let signals: Vec<_> = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let (dead, alive): (Vec<_>, Vec<_>) = inner
                .links
                .drain(..)
                .partition(|(a, b, _)| *a == peer || *b == peer);
            inner.links = alive;
            dead.into_iter().map(|(_, _, s)| s).collect()
        };
        for signal in signals {
            signal.trigger();
        }
    }
}

enum Role {
    Initiator(mpsc::Sender<DuplexStream>),
    Responder(tokio::sync::Mutex<mpsc::Receiver<DuplexStream>>),
}

/// One half of an in-memory link.
pub struct MemoryLink {
    remote: PubKey,
    role: Role,
    signal: Arc<CloseSignal>,
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("remote", &self.remote)
            .finish()
    }
}

/// In-memory bidirectional stream.
pub struct MemoryStream(DuplexStream);

impl LinkStream for MemoryStream {
    type Tx = WriteHalf<DuplexStream>;
    type Rx = ReadHalf<DuplexStream>;

    fn into_split(self) -> (Self::Tx, Self::Rx) {
        let (rx, tx) = tokio::io::split(self.0);
        (tx, rx)
    }
}

impl Link for MemoryLink {
    type Stream = MemoryStream;

    fn remote_key(&self) -> PubKey {
        self.remote
    }

    async fn open_stream(&self) -> Result<MemoryStream, OverlayError> {
        if self.signal.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        match &self.role {
            Role::Initiator(tx) => {
                let (mine, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
                tx.send(theirs)
                    .await
                    .map_err(|_| OverlayError::Closed)?;
                Ok(MemoryStream(mine))
            }
            Role::Responder(_) => Err(OverlayError::Stream(
                "responder cannot initiate streams".into(),
            )),
        }
    }

    async fn accept_stream(&self) -> Result<MemoryStream, OverlayError> {
        match &self.role {
            Role::Responder(rx) => {
                let mut rx = rx.lock().await;
                rx.recv()
                    .await
                    .map(MemoryStream)
                    .ok_or(OverlayError::Closed)
            }
            Role::Initiator(_) => Err(OverlayError::Stream(
                "initiator cannot accept streams".into(),
            )),
        }
    }

    async fn closed(&self) {
        self.signal.wait().await;
    }

    fn close(&self) {
        self.signal.trigger();
    }
}

/// An in-memory overlay endpoint.
pub struct MemoryOverlay {
    local: PubKey,
    hub: MemoryHub,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MemoryLink>>,
    shut: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOverlay")
            .field("local", &self.local)
            .finish()
    }
}

impl Overlay for MemoryOverlay {
    type Link = MemoryLink;

    fn local_key(&self) -> PubKey {
        self.local
    }

    async fn dial_link(&self, addr: &PeerAddress) -> Result<MemoryLink, OverlayError> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        let target = addr.peer_id;
        let accept_tx = {
            let inner = self
                .hub
                .inner
                .lock()
                .map_err(|_| OverlayError::Dial("hub lock poisoned".into()))?;
            inner
                .endpoints
                .get(&target)
                .cloned()
                .ok_or_else(|| OverlayError::Dial(format!("peer {target:?} unreachable")))?
        };

        let (stream_tx, stream_rx) = mpsc::channel(8);
        let signal = Arc::new(CloseSignal::default());

        let responder = MemoryLink {
            remote: self.local,
            role: Role::Responder(tokio::sync::Mutex::new(stream_rx)),
            signal: signal.clone(),
        };
        accept_tx
            .send(responder)
            .await
            .map_err(|_| OverlayError::Dial(format!("peer {target:?} stopped accepting")))?;

        if let Ok(mut inner) = self.hub.inner.lock() {
            inner.links.push((self.local, target, signal.clone()));
        }

        Ok(MemoryLink {
            remote: target,
            role: Role::Initiator(stream_tx),
            signal,
        })
    }

    async fn accept_link(&self) -> Option<MemoryLink> {
        if self.shut.load(Ordering::SeqCst) {
            return None;
        }
        self.accept_rx.lock().await.recv().await
    }

    async fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
        if let Ok(mut inner) = self.hub.inner.lock() {
            inner.endpoints.remove(&self.local);
        }
        self.hub.sever_peer(self.local);
    }
}
