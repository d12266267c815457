//! Transport backends behind one channel surface
//!
//! The engine never branches on how bytes reach the peer. [`PeerLink`]
//! and [`PeerChannel`] fold the direct QUIC path, the in-memory pair used
//! by tests, and a relayed circuit into the [`FrameChannel`] shape the
//! chunk coordinator already speaks, so the streaming code is identical
//! on every path.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use net_transport::{
    FrameChannel, LinkStats, MemChannel, MemLink, QuicChannel, QuicLink, TransportResult,
};
use relay_circuit::{
    CircuitManager, RelayChannel, RelayConnection, RelayDialer, RelayResult, TargetSession,
};
use tokio::sync::mpsc;
use wire_protocol::ChannelId;

/// One connection to the peer, whichever transport carries it
pub enum PeerLink {
    Quic(QuicLink),
    Mem(MemLink),
}

impl PeerLink {
    pub async fn open_channel(&self, id: ChannelId) -> TransportResult<PeerChannel> {
        match self {
            Self::Quic(link) => Ok(PeerChannel::Quic(link.open_channel(id).await?)),
            Self::Mem(link) => Ok(PeerChannel::Mem(link.open_channel(id).await?)),
        }
    }

    pub async fn accept_channel(&mut self) -> TransportResult<PeerChannel> {
        match self {
            Self::Quic(link) => Ok(PeerChannel::Quic(link.accept_channel().await?)),
            Self::Mem(link) => Ok(PeerChannel::Mem(link.accept_channel().await?)),
        }
    }

    /// Kernel-level path stats where the transport exposes them
    pub fn stats(&self) -> Option<LinkStats> {
        match self {
            Self::Quic(link) => Some(link.stats()),
            Self::Mem(_) => None,
        }
    }

    pub fn close(&self, reason: &str) {
        match self {
            Self::Quic(link) => link.close(reason),
            Self::Mem(link) => link.close(),
        }
    }
}

impl From<QuicLink> for PeerLink {
    fn from(link: QuicLink) -> Self {
        Self::Quic(link)
    }
}

impl From<MemLink> for PeerLink {
    fn from(link: MemLink) -> Self {
        Self::Mem(link)
    }
}

/// One channel endpoint, whichever transport carries it
pub enum PeerChannel {
    Quic(QuicChannel),
    Mem(MemChannel),
    Relay(RelayChannel),
}

impl FrameChannel for PeerChannel {
    fn id(&self) -> ChannelId {
        match self {
            Self::Quic(c) => c.id(),
            Self::Mem(c) => c.id(),
            Self::Relay(c) => c.id(),
        }
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        match self {
            Self::Quic(c) => c.send(frame).await,
            Self::Mem(c) => c.send(frame).await,
            Self::Relay(c) => c.send(frame).await,
        }
    }

    fn buffered_amount(&self) -> usize {
        match self {
            Self::Quic(c) => c.buffered_amount(),
            Self::Mem(c) => c.buffered_amount(),
            Self::Relay(c) => c.buffered_amount(),
        }
    }

    async fn drained(&self) {
        match self {
            Self::Quic(c) => c.drained().await,
            Self::Mem(c) => c.drained().await,
            Self::Relay(c) => c.drained().await,
        }
    }

    async fn recv(&mut self) -> Option<Bytes> {
        match self {
            Self::Quic(c) => c.recv().await,
            Self::Mem(c) => c.recv().await,
            Self::Relay(c) => c.recv().await,
        }
    }

    fn is_open(&self) -> bool {
        match self {
            Self::Quic(c) => c.is_open(),
            Self::Mem(c) => c.is_open(),
            Self::Relay(c) => c.is_open(),
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Quic(c) => c.close().await,
            Self::Mem(c) => c.close().await,
            Self::Relay(c) => c.close().await,
        }
    }
}

/// Builds a circuit to the peer when the direct path gives out.
///
/// Type-erases the dialer so the engine does not carry the circuit
/// manager's generics around.
#[derive(Clone)]
pub struct RelayClient {
    connect: Arc<dyn Fn() -> BoxFuture<'static, RelayResult<RelayConnection>> + Send + Sync>,
}

impl RelayClient {
    /// `target` is the address the circuit's exit hop dials to reach the
    /// peer
    pub fn new<D>(manager: Arc<CircuitManager<D>>, target: impl Into<String>) -> Self
    where
        D: RelayDialer + 'static,
    {
        let target = target.into();
        Self {
            connect: Arc::new(move || {
                let manager = manager.clone();
                let target = target.clone();
                Box::pin(async move { manager.connect(&target).await })
            }),
        }
    }

    pub(crate) async fn connect(&self) -> RelayResult<RelayConnection> {
        (self.connect)().await
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RelayClient")
    }
}

/// Incoming relayed sessions, fed by whatever accepts circuits for this
/// peer; the receive side of the fallback takes the next one when the
/// sender announces a path switch
pub type RelayIncoming = mpsc::UnboundedReceiver<TargetSession>;

/// Loss fraction derived from a link's packet counters
pub(crate) fn loss_fraction(stats: &LinkStats) -> f64 {
    if stats.packets_sent == 0 {
        0.0
    } else {
        stats.packets_lost as f64 / stats.packets_sent as f64
    }
}
