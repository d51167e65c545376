//! Overlay transport abstraction
//!
//! Decouples the peer swarm from any concrete overlay. Production binds
//! an iroh endpoint (`haven-net-iroh`); tests use the in-memory overlay
//! in [`crate::sim`]. The overlay owns connectivity and reconnection;
//! the swarm's responsibility ends at issuing dials and running the
//! membership handshake.

use haven_model::types::PubKey;
use haven_model::PeerAddress;
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("bind failed: {0}")]
    Bind(String),

    /// Per-peer dial failure: non-fatal, logged by the caller.
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("membership handshake rejected")]
    HandshakeRejected,

    #[error("overlay closed")]
    Closed,
}

/// A bidirectional byte stream on a link.
pub trait LinkStream: Send + 'static {
    type Tx: tokio::io::AsyncWrite + Send + Unpin;
    type Rx: tokio::io::AsyncRead + Send + Unpin;

    fn into_split(self) -> (Self::Tx, Self::Rx);
}

/// An established connection to one remote peer.
pub trait Link: Send + Sync + 'static {
    type Stream: LinkStream;

    fn remote_key(&self) -> PubKey;

    /// Open a new stream (initiator side of a protocol exchange).
    fn open_stream(&self) -> impl Future<Output = Result<Self::Stream, OverlayError>> + Send;

    /// Accept a stream the remote opened.
    fn accept_stream(&self) -> impl Future<Output = Result<Self::Stream, OverlayError>> + Send;

    /// Resolves when the link is gone, however it died.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Tear the link down locally.
    fn close(&self);
}

/// An overlay endpoint bound to the local identity.
pub trait Overlay: Send + Sync + 'static {
    type Link: Link;

    fn local_key(&self) -> PubKey;

    fn dial_link(
        &self,
        addr: &PeerAddress,
    ) -> impl Future<Output = Result<Self::Link, OverlayError>> + Send;

    /// Next inbound link, or `None` once the overlay is shut down.
    fn accept_link(&self) -> impl Future<Output = Option<Self::Link>> + Send;

    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}
