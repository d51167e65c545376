//! Iroh overlay for Haven networking
//!
//! Binds an iroh endpoint to the device's Ed25519 secret key, so the
//! same identity signs log entries and authenticates QUIC connections.
//! Discovery: a static provider for directly injected peer info, mDNS
//! for the local network, DHT and DNS for the internet.
//!
//! The onion host in a peer address is not consumed here; iroh dials by
//! public key and resolves reachability through its discovery services.

use haven_model::types::PubKey;
use haven_model::{DeviceIdentity, PeerAddress};
use haven_net::overlay::{Link, LinkStream, Overlay, OverlayError};
use iroh::discovery::dns::DnsDiscovery;
use iroh::discovery::mdns::MdnsDiscovery;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::discovery::static_provider::StaticProvider;
use iroh::{Endpoint, NodeAddr};

/// ALPN protocol identifier for Haven connections.
pub const HAVEN_ALPN: &[u8] = b"haven/1";

/// Overlay endpoint backed by iroh QUIC.
#[derive(Clone)]
pub struct IrohOverlay {
    endpoint: Endpoint,
    static_discovery: StaticProvider,
}

impl std::fmt::Debug for IrohOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohOverlay")
            .field("public_key", &self.endpoint.secret_key().public())
            .finish()
    }
}

impl IrohOverlay {
    /// Bind an endpoint using the device identity's signing key.
    pub async fn bind(identity: &DeviceIdentity) -> Result<Self, OverlayError> {
        let secret_key = iroh::SecretKey::from(identity.signing_key().to_bytes());

        // Directly injected peer info takes priority over discovery.
        let static_discovery = StaticProvider::new();
        let mdns = MdnsDiscovery::builder();
        let dht = DhtDiscovery::builder()
            .build()
            .map_err(|e| OverlayError::Bind(e.to_string()))?;
        let dns = DnsDiscovery::n0_dns();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![HAVEN_ALPN.to_vec()])
            .add_discovery(static_discovery.clone())
            .add_discovery(mdns)
            .add_discovery(dht)
            .add_discovery(dns)
            .bind()
            .await
            .map_err(|e| OverlayError::Bind(e.to_string()))?;

        Ok(Self {
            endpoint,
            static_discovery,
        })
    }

    /// Inject a peer's address info out of band (tests, invites).
    pub fn add_peer_info(&self, info: impl Into<NodeAddr>) {
        self.static_discovery.add_node_info(info.into());
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Adapter: iroh bi-stream halves → `LinkStream`.
pub struct IrohStream {
    send: iroh::endpoint::SendStream,
    recv: iroh::endpoint::RecvStream,
}

impl LinkStream for IrohStream {
    type Tx = iroh::endpoint::SendStream;
    type Rx = iroh::endpoint::RecvStream;

    fn into_split(self) -> (Self::Tx, Self::Rx) {
        (self.send, self.recv)
    }
}

/// Adapter: iroh connection → `Link`.
pub struct IrohLink {
    conn: iroh::endpoint::Connection,
    remote: PubKey,
}

impl Link for IrohLink {
    type Stream = IrohStream;

    fn remote_key(&self) -> PubKey {
        self.remote
    }

    async fn open_stream(&self) -> Result<IrohStream, OverlayError> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|e| OverlayError::Stream(e.to_string()))?;
        Ok(IrohStream { send, recv })
    }

    async fn accept_stream(&self) -> Result<IrohStream, OverlayError> {
        let (send, recv) = self
            .conn
            .accept_bi()
            .await
            .map_err(|e| OverlayError::Stream(e.to_string()))?;
        Ok(IrohStream { send, recv })
    }

    async fn closed(&self) {
        let _ = self.conn.closed().await;
    }

    fn close(&self) {
        self.conn.close(0u32.into(), b"closed");
    }
}

impl Overlay for IrohOverlay {
    type Link = IrohLink;

    fn local_key(&self) -> PubKey {
        PubKey::new(*self.endpoint.secret_key().public().as_bytes())
    }

    async fn dial_link(&self, addr: &PeerAddress) -> Result<IrohLink, OverlayError> {
        let node_id = iroh::PublicKey::from_bytes(addr.peer_id.as_bytes())
            .map_err(|e| OverlayError::Dial(format!("invalid peer key: {e}")))?;
        let conn = self
            .endpoint
            .connect(node_id, HAVEN_ALPN)
            .await
            .map_err(|e| OverlayError::Dial(e.to_string()))?;
        Ok(IrohLink {
            conn,
            remote: addr.peer_id,
        })
    }

    async fn accept_link(&self) -> Option<IrohLink> {
        loop {
            let incoming = self.endpoint.accept().await?;
            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    tracing::warn!("incoming connection failed: {e}");
                    continue;
                }
            };
            let conn = match connecting.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("incoming handshake failed: {e}");
                    continue;
                }
            };
            let remote = match conn.remote_node_id() {
                Ok(node_id) => PubKey::new(*node_id.as_bytes()),
                Err(e) => {
                    tracing::warn!("rejecting connection without node id: {e}");
                    continue;
                }
            };
            return Some(IrohLink { conn, remote });
        }
    }

    async fn shutdown(&self) {
        self.endpoint.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_binds_with_identity_key() {
        let identity = DeviceIdentity::generate();
        let overlay = IrohOverlay::bind(&identity).await.expect("bind");
        assert_eq!(overlay.local_key(), identity.public_key());
        overlay.shutdown().await;
    }
}
