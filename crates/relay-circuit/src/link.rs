//! Cell links between circuit participants
//!
//! A link carries whole cells in both directions. Relay fleets speak
//! WebSocket binary frames; the in-process fabric wires links through
//! queues for loopback deployments and tests.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async,
    tungstenite::protocol::Message,
};
use tracing::{debug, warn};

use crate::{RelayCell, RelayError, RelayResult};

/// Bidirectional cell pipe
pub trait CellLink: Send + 'static {
    fn send(&mut self, cell: RelayCell) -> impl Future<Output = RelayResult<()>> + Send;
    fn recv(&mut self) -> impl Future<Output = Option<RelayCell>> + Send;
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens cell links by relay address
pub trait RelayDialer: Send + Sync + 'static {
    type Link: CellLink;
    fn dial(&self, address: &str) -> impl Future<Output = RelayResult<Self::Link>> + Send;
}

/// In-process cell link endpoint
pub struct MemCellLink {
    tx: Option<mpsc::UnboundedSender<RelayCell>>,
    rx: mpsc::UnboundedReceiver<RelayCell>,
}

/// Connected in-process link pair
pub fn mem_cell_pair() -> (MemCellLink, MemCellLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemCellLink {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemCellLink {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

impl CellLink for MemCellLink {
    async fn send(&mut self, cell: RelayCell) -> RelayResult<()> {
        // Encoding enforces the cell size limit even off the wire.
        cell.encode()?;
        self.tx
            .as_ref()
            .ok_or(RelayError::LinkClosed)?
            .send(cell)
            .map_err(|_| RelayError::LinkClosed)
    }

    async fn recv(&mut self) -> Option<RelayCell> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        // Dropping the sender is the peer's end-of-stream.
        self.tx = None;
        self.rx.close();
    }
}

/// Drive a link from a task, exposing queue halves that can be cloned
/// and moved independently. The task ends when either side closes.
pub fn pump_link<L: CellLink>(
    mut link: L,
) -> (
    mpsc::UnboundedSender<RelayCell>,
    mpsc::UnboundedReceiver<RelayCell>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayCell>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = out_rx.recv() => match maybe {
                    Some(cell) => {
                        if link.send(cell).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                maybe = link.recv() => match maybe {
                    Some(cell) => {
                        if in_tx.send(cell).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        link.close().await;
    });

    (out_tx, in_rx)
}

/// Names in-process listeners so relays can dial each other by address
#[derive(Clone, Default)]
pub struct MemFabric {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<MemCellLink>>>,
}

impl MemFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address`; dialed links arrive on the returned receiver
    pub fn listen(&self, address: &str) -> mpsc::UnboundedReceiver<MemCellLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(address.to_string(), tx);
        rx
    }
}

impl RelayDialer for MemFabric {
    type Link = MemCellLink;

    async fn dial(&self, address: &str) -> RelayResult<MemCellLink> {
        let listener = self
            .listeners
            .get(address)
            .ok_or_else(|| RelayError::Connection(format!("no listener at {address}")))?;
        let (near, far) = mem_cell_pair();
        listener
            .send(far)
            .map_err(|_| RelayError::Connection(format!("listener at {address} is gone")))?;
        Ok(near)
    }
}

/// Cell link over a WebSocket connection
pub struct WsCellLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsCellLink {
    /// Dial a relay's WebSocket endpoint
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        debug!(url, "relay link connected");
        Ok(Self { ws })
    }

    /// Upgrade an accepted TCP connection
    pub async fn accept(stream: TcpStream) -> RelayResult<Self> {
        let ws = accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        Ok(Self { ws })
    }
}

impl CellLink for WsCellLink {
    async fn send(&mut self, cell: RelayCell) -> RelayResult<()> {
        let bytes = cell.encode()?;
        self.ws
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| RelayError::LinkClosed)
    }

    async fn recv(&mut self) -> Option<RelayCell> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Binary(data)) => match RelayCell::decode(&data) {
                    Ok(cell) => return Some(cell),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed cell");
                        return None;
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "relay link receive error");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Dials relays over WebSocket
#[derive(Clone, Default)]
pub struct WsDialer;

impl RelayDialer for WsDialer {
    type Link = WsCellLink;

    async fn dial(&self, address: &str) -> RelayResult<WsCellLink> {
        WsCellLink::connect(address).await
    }
}

/// Bind a WebSocket cell listener; accepted links arrive on the receiver
pub async fn ws_listen(
    bind: SocketAddr,
) -> RelayResult<(SocketAddr, mpsc::UnboundedReceiver<WsCellLink>)> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| RelayError::Connection(e.to_string()))?;
    let local = listener
        .local_addr()
        .map_err(|e| RelayError::Connection(e.to_string()))?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => match WsCellLink::accept(stream).await {
                    Ok(link) => {
                        if tx.send(link).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "websocket upgrade failed"),
                },
                Err(e) => {
                    warn!(error = %e, "relay accept failed");
                    break;
                }
            }
        }
    });

    Ok((local, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_links_carry_cells() {
        let (mut a, mut b) = mem_cell_pair();
        a.send(RelayCell::Created { circuit: 9 }).await.unwrap();
        assert!(matches!(
            b.recv().await,
            Some(RelayCell::Created { circuit: 9 })
        ));
    }

    #[tokio::test]
    async fn fabric_dials_registered_listeners() {
        let fabric = MemFabric::new();
        let mut incoming = fabric.listen("mem://relay-1");

        let mut near = fabric.dial("mem://relay-1").await.unwrap();
        let mut far = incoming.recv().await.unwrap();

        near.send(RelayCell::Teardown { circuit: 1 }).await.unwrap();
        assert!(matches!(
            far.recv().await,
            Some(RelayCell::Teardown { circuit: 1 })
        ));

        assert!(fabric.dial("mem://missing").await.is_err());
    }

    #[tokio::test]
    async fn ws_links_round_trip_cells() {
        let (addr, mut incoming) = ws_listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let dial = tokio::spawn(async move { WsCellLink::connect(&format!("ws://{addr}")).await });
        let mut server = incoming.recv().await.unwrap();
        let mut client = dial.await.unwrap().unwrap();

        client
            .send(RelayCell::Forward {
                circuit: 3,
                payload: vec![1, 2, 3],
            })
            .await
            .unwrap();
        match server.recv().await {
            Some(RelayCell::Forward { circuit: 3, payload }) => assert_eq!(payload, vec![1, 2, 3]),
            other => panic!("unexpected cell: {other:?}"),
        }

        server.send(RelayCell::Created { circuit: 3 }).await.unwrap();
        assert!(matches!(
            client.recv().await,
            Some(RelayCell::Created { circuit: 3 })
        ));

        client.close().await;
        assert!(server.recv().await.is_none());
    }
}
