//! Engine entry points

use tokio::sync::mpsc;
use tracing::info;
use wire_protocol::{PeerId, TransferId};

use net_transport::cancel_pair;

use crate::backend::{PeerLink, RelayClient, RelayIncoming};
use crate::config::EngineConfig;
use crate::error::TransferResult;
use crate::receiver::{PendingTransfer, accept_handshake};
use crate::sender::{OutboundTransfer, run_sender};
use crate::session::{SessionCore, TransferPayload};

/// Starts and accepts transfers. Cheap to clone; every transfer runs on
/// its own task and owns its session state, so one engine can drive any
/// number of them.
#[derive(Debug, Clone)]
pub struct Engine {
    peer_id: PeerId,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            peer_id: PeerId::new(),
            config,
        }
    }

    /// Use a fixed peer identity instead of a freshly generated one
    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start sending `payload` to the peer on `link`. A relay client,
    /// when given, is the one fallback tried if the direct path dies.
    pub fn initiate_transfer(
        &self,
        link: PeerLink,
        payload: TransferPayload,
        relay: Option<RelayClient>,
    ) -> OutboundTransfer {
        let id = TransferId::new();
        let (cancel_handle, cancel) = cancel_pair();
        let (events_tx, events) = mpsc::unbounded_channel();
        let core = SessionCore::new(id, self.config.adaptive.clone(), cancel, events_tx);
        info!(
            transfer = %id,
            name = %payload.name,
            bytes = payload.data.len(),
            "initiating transfer"
        );
        let task = tokio::spawn(run_sender(
            core,
            self.config.clone(),
            self.peer_id,
            link,
            payload,
            relay,
        ));
        OutboundTransfer::new(id, events, cancel_handle, task)
    }

    /// Wait for a peer's offer on `link` and run the handshake up to the
    /// opened manifest; the offer is then resolved through the returned
    /// [`PendingTransfer`]. `relay` feeds relayed sessions for the
    /// fallback, if something is accepting circuits for this peer.
    pub async fn accept_transfer(
        &self,
        link: PeerLink,
        relay: Option<RelayIncoming>,
    ) -> TransferResult<PendingTransfer> {
        accept_handshake(self.config.clone(), link, relay).await
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use net_transport::{ChannelLimits, MemLink};
    use relay_circuit::{
        CircuitConfig, CircuitManager, MemFabric, RelayNode, StaticDirectory, TargetSession,
    };
    use wire_protocol::TransferState;

    use crate::error::ErrorKind;
    use crate::events::TransferEvent;
    use crate::receiver::ReceivedFile;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Spin up `count` in-process relays and a directory listing them
    fn relay_fabric(count: usize) -> (MemFabric, Arc<StaticDirectory>) {
        let fabric = MemFabric::new();
        let mut descriptors = Vec::new();
        for i in 0..count {
            let id = format!("relay-{i}");
            let address = format!("mem://{id}");
            let node = Arc::new(RelayNode::new(&id, &address, fabric.clone()));
            descriptors.push(node.descriptor());
            node.serve(fabric.listen(&address));
        }
        (fabric, Arc::new(StaticDirectory::new(descriptors)))
    }

    /// Accept circuits landing at `address` and queue them for the
    /// receive side's fallback
    fn relay_listener(fabric: &MemFabric, address: &str) -> RelayIncoming {
        let mut incoming = fabric.listen(address);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                let session = TargetSession::accept(link, ChannelLimits::default());
                if tx.send(session).is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn file_crosses_an_in_memory_link_end_to_end() {
        let (a, b) = MemLink::pair();
        let sender_engine = Engine::default();
        let receiver_engine = Engine::new(EngineConfig {
            data_channels: 3,
            ..EngineConfig::default()
        });

        let data = patterned(4 * 1024 * 1024);
        let payload =
            TransferPayload::from_bytes("island.tar", data.clone()).with_mime("application/x-tar");

        let mut outbound = sender_engine.initiate_transfer(PeerLink::Mem(a), payload, None);

        let pending = receiver_engine
            .accept_transfer(PeerLink::Mem(b), None)
            .await
            .unwrap();
        assert_eq!(pending.manifest().name, "island.tar");
        assert_eq!(pending.manifest().size, data.len() as u64);
        assert_eq!(pending.manifest().mime.as_deref(), Some("application/x-tar"));
        let receiver_task = tokio::spawn(pending.accept().finish());

        let mut saw_transferring = false;
        let mut saw_verifying = false;
        while let Some(event) = outbound.next_event().await {
            match event {
                TransferEvent::StateChanged {
                    to: TransferState::Transferring,
                    ..
                } => saw_transferring = true,
                TransferEvent::StateChanged {
                    to: TransferState::Verifying,
                    ..
                } => saw_verifying = true,
                TransferEvent::Failed { message, .. } => panic!("transfer failed: {message}"),
                _ => {}
            }
        }
        let report = outbound.finish().await.unwrap();
        assert!(saw_transferring);
        assert!(saw_verifying);
        assert_eq!(report.bytes_moved, data.len() as u64);
        assert!(!report.relay_used);

        let received: ReceivedFile = receiver_task.await.unwrap().unwrap();
        assert_eq!(received.data, data);
        assert_eq!(received.manifest.size, data.len() as u64);
        assert_eq!(received.report.bytes_moved, data.len() as u64);
    }

    #[tokio::test]
    async fn stalled_direct_path_falls_back_to_relay() {
        // A link whose data frames can never clear the drain budget:
        // control traffic fits, chunk frames park forever.
        let limits = ChannelLimits {
            high_watermark: 64 * 1024,
            low_watermark: 16 * 1024,
        };
        let (a, b) = MemLink::pair_with(limits, false);
        a.drain_control().grant(32 * 1024);
        b.drain_control().grant(32 * 1024);

        let (fabric, directory) = relay_fabric(3);
        let manager = Arc::new(CircuitManager::new(
            directory,
            fabric.clone(),
            CircuitConfig::default(),
        ));
        let relay_client = RelayClient::new(manager, "mem://peer-receiver");
        let relay_incoming = relay_listener(&fabric, "mem://peer-receiver");

        let config = EngineConfig {
            handshake_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_millis(300),
            metrics_interval: Duration::from_millis(100),
            feedback_interval: Duration::from_millis(100),
            limits,
            ..EngineConfig::default()
        };
        let sender_engine = Engine::new(config.clone());
        let receiver_engine = Engine::new(config);

        let data = patterned(1024 * 1024);
        let payload = TransferPayload::from_bytes("overland.bin", data.clone());

        let mut outbound =
            sender_engine.initiate_transfer(PeerLink::Mem(a), payload, Some(relay_client));
        let pending = timeout(
            Duration::from_secs(5),
            receiver_engine.accept_transfer(PeerLink::Mem(b), Some(relay_incoming)),
        )
        .await
        .unwrap()
        .unwrap();
        let receiver_task = tokio::spawn(pending.accept().finish());

        let mut route = None;
        timeout(Duration::from_secs(20), async {
            while let Some(event) = outbound.next_event().await {
                match event {
                    TransferEvent::PathSwitched { route: hops } => route = Some(hops),
                    TransferEvent::Failed { message, .. } => {
                        panic!("transfer failed: {message}")
                    }
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        let report = outbound.finish().await.unwrap();
        assert!(report.relay_used);
        assert_eq!(route.expect("no path switch seen").len(), 3);

        let received = receiver_task.await.unwrap().unwrap();
        assert_eq!(received.data, data);
        assert!(received.report.relay_used);
    }

    #[tokio::test]
    async fn receiver_cancel_reaches_the_parked_sender() {
        // Same starved link shape, but no relay anywhere: the transfer
        // can only park until someone gives up.
        let limits = ChannelLimits {
            high_watermark: 64 * 1024,
            low_watermark: 16 * 1024,
        };
        let (a, b) = MemLink::pair_with(limits, false);
        a.drain_control().grant(32 * 1024);
        b.drain_control().grant(32 * 1024);

        let config = EngineConfig {
            handshake_timeout: Duration::from_secs(5),
            metrics_interval: Duration::from_millis(100),
            feedback_interval: Duration::from_millis(100),
            limits,
            ..EngineConfig::default()
        };
        let sender_engine = Engine::new(config.clone());
        let receiver_engine = Engine::new(config);

        let payload = TransferPayload::from_bytes("stuck.bin", patterned(1024 * 1024));
        let mut outbound = sender_engine.initiate_transfer(PeerLink::Mem(a), payload, None);
        let pending = timeout(
            Duration::from_secs(5),
            receiver_engine.accept_transfer(PeerLink::Mem(b), None),
        )
        .await
        .unwrap()
        .unwrap();
        let mut inbound = pending.accept();

        timeout(Duration::from_secs(5), async {
            while let Some(event) = inbound.next_event().await {
                if matches!(
                    event,
                    TransferEvent::StateChanged {
                        to: TransferState::Transferring,
                        ..
                    }
                ) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        inbound.cancel();

        let receiver_err = timeout(Duration::from_secs(5), inbound.finish())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(receiver_err.kind(), ErrorKind::Cancelled);

        let mut saw_cancelled = false;
        timeout(Duration::from_secs(5), async {
            while let Some(event) = outbound.next_event().await {
                match event {
                    TransferEvent::StateChanged {
                        to: TransferState::Cancelled,
                        ..
                    } => saw_cancelled = true,
                    TransferEvent::Completed(_) => panic!("cancelled transfer completed"),
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_cancelled);
        let sender_err = timeout(Duration::from_secs(5), outbound.finish())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(sender_err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn rejected_offer_fails_the_sender_cleanly() {
        let (a, b) = MemLink::pair();
        let sender_engine = Engine::default();
        let receiver_engine = Engine::default();

        let payload = TransferPayload::from_bytes("unwanted.bin", patterned(64 * 1024));
        let outbound = sender_engine.initiate_transfer(PeerLink::Mem(a), payload, None);

        let pending = receiver_engine
            .accept_transfer(PeerLink::Mem(b), None)
            .await
            .unwrap();
        pending.reject("not today").await.unwrap();

        let err = outbound.finish().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("not today"));
    }

    #[tokio::test]
    async fn oversized_offer_is_refused_before_accept() {
        let (a, b) = MemLink::pair();
        let sender_engine = Engine::default();
        let receiver_engine = Engine::new(EngineConfig {
            max_file_size: 1024,
            ..EngineConfig::default()
        });

        let payload = TransferPayload::from_bytes("too-big.bin", patterned(4096));
        let outbound = sender_engine.initiate_transfer(PeerLink::Mem(a), payload, None);

        let err = receiver_engine
            .accept_transfer(PeerLink::Mem(b), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        let sender_err = outbound.finish().await.unwrap_err();
        assert_eq!(sender_err.kind(), ErrorKind::Protocol);
        assert!(sender_err.to_string().contains("exceeds"));
    }
}
