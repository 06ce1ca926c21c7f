//! Message transport between the phone and host contexts.
//!
//! Frames are opaque byte buffers (JSON documents). Each inbound frame is
//! tagged with the sender's [`Origin`] so receivers can check identity
//! before they even parse it.
//!
//! Two bindings are provided:
//! * [`channel_pair`]: an in-process duplex channel, one endpoint per context;
//! * length-prefixed frames over any async byte stream
//!   (`[4-byte big-endian length][payload]`), used for stdin/stdout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Frames larger than this are treated as corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identity of the context that posted a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    pub fn new(origin: impl Into<String>) -> Self {
        Self(origin.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A frame as received, with the transport-level sender identity.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub origin: Origin,
    pub frame: Vec<u8>,
}

/// Sending half of a transport.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn post(&self, frame: Vec<u8>) -> Result<()>;
}

// ── In-process channel ────────────────────────────────────────────────

pub struct ChannelOutbound {
    origin: Origin,
    peer: mpsc::Sender<Inbound>,
}

#[async_trait]
impl Outbound for ChannelOutbound {
    async fn post(&self, frame: Vec<u8>) -> Result<()> {
        self.peer
            .send(Inbound {
                origin: self.origin.clone(),
                frame,
            })
            .await
            .map_err(|_| BridgeError::Transport("peer endpoint closed".into()))
    }
}

pub struct Endpoint {
    pub outbound: Arc<ChannelOutbound>,
    pub inbound: mpsc::Receiver<Inbound>,
    inbox: mpsc::WeakSender<Inbound>,
}

impl Endpoint {
    /// A sender that posts into this endpoint's inbox under an arbitrary
    /// origin, as any co-resident context on a shared channel could.
    /// `None` once the inbox has closed.
    pub fn injector(&self, origin: Origin) -> Option<ChannelOutbound> {
        self.inbox
            .upgrade()
            .map(|peer| ChannelOutbound { origin, peer })
    }
}

/// Create two connected endpoints. Frames posted on `a` arrive at `b`
/// tagged with `a_origin`, and vice versa.
pub fn channel_pair(a_origin: Origin, b_origin: Origin, capacity: usize) -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let a = Endpoint {
        outbound: Arc::new(ChannelOutbound {
            origin: a_origin,
            peer: b_tx.clone(),
        }),
        inbound: a_rx,
        inbox: a_tx.downgrade(),
    };
    let b = Endpoint {
        outbound: Arc::new(ChannelOutbound {
            origin: b_origin,
            peer: a_tx,
        }),
        inbound: b_rx,
        inbox: b_tx.downgrade(),
    };
    (a, b)
}

// ── Frame I/O ─────────────────────────────────────────────────────────

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

/// Writes frames to a byte stream, one writer at a time.
pub struct FramedOutbound<W> {
    writer: Mutex<W>,
}

impl<W> FramedOutbound<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Outbound for FramedOutbound<W> {
    async fn post(&self, frame: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

/// Read frames from `reader` until EOF, forwarding them tagged with `origin`.
/// The returned channel closes when the stream ends or turns corrupt.
pub fn spawn_frame_reader<R>(mut reader: R, origin: Origin) -> mpsc::Receiver<Inbound>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    let inbound = Inbound {
                        origin: origin.clone(),
                        frame,
                    };
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(%origin, "frame stream closed");
                    break;
                }
                Err(e) => {
                    warn!(%origin, error = %e, "frame stream failed");
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_tags_origin() {
        let (phone, mut host) = channel_pair(Origin::new("phone"), Origin::new("host"), 8);
        phone.outbound.post(b"ping".to_vec()).await.unwrap();
        let got = host.inbound.recv().await.unwrap();
        assert_eq!(got.origin, Origin::new("phone"));
        assert_eq!(got.frame, b"ping");
    }

    #[tokio::test]
    async fn test_injector_uses_forged_origin() {
        let (mut phone, _host) = channel_pair(Origin::new("phone"), Origin::new("host"), 8);
        phone
            .injector(Origin::new("evil"))
            .unwrap()
            .post(b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(phone.inbound.recv().await.unwrap().origin, Origin::new("evil"));
    }

    #[tokio::test]
    async fn test_post_to_closed_peer_is_transport_error() {
        let (phone, host) = channel_pair(Origin::new("phone"), Origin::new("host"), 8);
        drop(host);
        let err = phone.outbound.post(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn test_frames_over_byte_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let out = FramedOutbound::new(client);
        out.post(b"one".to_vec()).await.unwrap();
        out.post(b"two".to_vec()).await.unwrap();
        drop(out);

        let mut rx = spawn_frame_reader(server, Origin::new("stdio"));
        assert_eq!(rx.recv().await.unwrap().frame, b"one");
        assert_eq!(rx.recv().await.unwrap().frame, b"two");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut data: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF];
        let err = read_frame(&mut data).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
