//! Length-delimited prost frames over link streams
//!
//! Thin wrappers over `LengthDelimitedCodec` so protocol code never does
//! manual buffer management.

use crate::overlay::OverlayError;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Framed writer for prost messages.
pub struct FrameSink<W: AsyncWrite + Unpin> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), OverlayError> {
        self.inner
            .send(Bytes::from(msg.encode_to_vec()))
            .await
            .map_err(|e| OverlayError::Stream(e.to_string()))
    }
}

/// Framed reader for prost messages.
pub struct FrameStream<R: AsyncRead + Unpin> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, LengthDelimitedCodec::new()),
        }
    }

    /// Next message, or `None` when the stream ends cleanly.
    pub async fn recv<M: Message + Default>(&mut self) -> Result<Option<M>, OverlayError> {
        match self.inner.next().await {
            Some(Ok(bytes)) => M::decode(&bytes[..])
                .map(Some)
                .map_err(|e| OverlayError::Stream(e.to_string())),
            Some(Err(e)) => Err(OverlayError::Stream(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint64, tag = "1")]
        nonce: u64,
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut sink = FrameSink::new(a);
        let mut stream = FrameStream::new(b);

        sink.send(&Ping { nonce: 42 }).await.unwrap();
        let received: Ping = stream.recv().await.unwrap().unwrap();
        assert_eq!(received.nonce, 42);
    }

    #[tokio::test]
    async fn recv_returns_none_on_clean_close() {
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let mut stream = FrameStream::new(b);
        let received: Option<Ping> = stream.recv().await.unwrap();
        assert!(received.is_none());
    }
}
