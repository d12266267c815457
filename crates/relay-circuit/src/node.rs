//! Relay node
//!
//! One hop of the circuit protocol: decapsulates its layer key on
//! Create, peels one onion layer on Forward, adds one on Backward, and
//! at the exit position bridges delivered payloads to the transfer
//! target. A node only ever sees the link it came from and the link it
//! dials next.
//!
//! The same implementation backs loopback deployments and the circuit
//! tests; production fleets run it behind a WebSocket listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crypto_session::{HybridKeyPair, decapsulate};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    LayerKey, RelayCell, RelayCommand, RelayDialer, RelayError, RelayNodeInfo, RelayReply,
    RelayResult, derive_layer_key, pump_link, unwrap_layer, wrap_layer,
};

const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

struct CircuitState {
    key: Arc<LayerKey>,
    next: Option<mpsc::UnboundedSender<RelayCell>>,
    target: Option<mpsc::UnboundedSender<RelayCell>>,
}

/// One relay hop
pub struct RelayNode<D: RelayDialer> {
    id: String,
    address: String,
    keypair: HybridKeyPair,
    dialer: D,
}

impl<D: RelayDialer> RelayNode<D> {
    pub fn new(id: &str, address: &str, dialer: D) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            keypair: HybridKeyPair::generate(),
            dialer,
        }
    }

    /// Descriptor for the directory
    pub fn descriptor(&self) -> RelayNodeInfo {
        RelayNodeInfo {
            id: self.id.clone(),
            address: self.address.clone(),
            kem_public: self.keypair.kem_public_bytes().to_vec(),
            ec_public: self.keypair.ec_public_bytes(),
            region: None,
        }
    }

    /// Serve incoming links until the listener goes away
    pub fn serve(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<D::Link>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(relay = %self.id, "relay node serving");
            while let Some(link) = incoming.recv().await {
                let node = self.clone();
                tokio::spawn(async move { node.handle_link(link).await });
            }
        })
    }

    async fn handle_link(self: Arc<Self>, link: D::Link) {
        let (back_tx, mut cells) = pump_link(link);
        let mut circuits: HashMap<u64, CircuitState> = HashMap::new();

        while let Some(cell) = cells.recv().await {
            match cell {
                RelayCell::Create {
                    circuit,
                    hop,
                    handshake,
                } => {
                    let reply = match self.open_circuit(&handshake, hop) {
                        Ok(key) => {
                            circuits.insert(
                                circuit,
                                CircuitState {
                                    key: Arc::new(key),
                                    next: None,
                                    target: None,
                                },
                            );
                            debug!(relay = %self.id, circuit, hop, "circuit created");
                            RelayCell::Created { circuit }
                        }
                        Err(e) => RelayCell::CreateFailed {
                            circuit,
                            reason: e.to_string(),
                        },
                    };
                    if back_tx.send(reply).is_err() {
                        break;
                    }
                }
                RelayCell::Forward { circuit, payload } => {
                    if let Err(e) = self
                        .on_forward(&mut circuits, circuit, &payload, &back_tx)
                        .await
                    {
                        warn!(relay = %self.id, circuit, error = %e, "forward failed, tearing down");
                        teardown(&mut circuits, circuit);
                    }
                }
                RelayCell::Teardown { circuit } => {
                    debug!(relay = %self.id, circuit, "teardown");
                    teardown(&mut circuits, circuit);
                }
                // Backward and Data cells never arrive on a client-facing
                // link; their pumps feed them in from the other side.
                RelayCell::Backward { circuit, .. } => {
                    warn!(relay = %self.id, circuit, "unexpected backward cell from client side");
                }
                other => {
                    warn!(relay = %self.id, cell = ?other, "unexpected cell");
                }
            }
        }

        for circuit in circuits.keys().copied().collect::<Vec<_>>() {
            teardown(&mut circuits, circuit);
        }
    }

    fn open_circuit(&self, handshake: &[u8], hop: u8) -> RelayResult<LayerKey> {
        let secret = decapsulate(handshake, &self.keypair)?;
        Ok(derive_layer_key(&secret, hop))
    }

    async fn on_forward(
        &self,
        circuits: &mut HashMap<u64, CircuitState>,
        circuit: u64,
        payload: &[u8],
        back_tx: &mpsc::UnboundedSender<RelayCell>,
    ) -> RelayResult<()> {
        let state = circuits
            .get_mut(&circuit)
            .ok_or(RelayError::UnknownCircuit(circuit))?;
        let inner = unwrap_layer(&state.key, payload)?;

        match bincode::deserialize::<RelayCommand>(&inner)? {
            RelayCommand::Relay(onward) => {
                let next = state.next.as_ref().ok_or_else(|| {
                    RelayError::Connection("relay command before extend".to_string())
                })?;
                next.send(RelayCell::Forward {
                    circuit,
                    payload: onward,
                })
                .map_err(|_| RelayError::LinkClosed)?;
                Ok(())
            }
            RelayCommand::Extend {
                address,
                hop,
                handshake,
            } => {
                let reply = match self
                    .extend(state, circuit, &address, hop, handshake, back_tx)
                    .await
                {
                    Ok(()) => RelayReply::Extended,
                    Err(e) => {
                        warn!(relay = %self.id, circuit, error = %e, "extend failed");
                        RelayReply::ExtendFailed(e.to_string())
                    }
                };
                send_reply(&state.key, circuit, &reply, back_tx)
            }
            RelayCommand::Connect { address } => {
                let reply = match self.connect_target(state, circuit, &address, back_tx).await {
                    Ok(()) => RelayReply::Connected,
                    Err(e) => {
                        warn!(relay = %self.id, circuit, error = %e, "target connect failed");
                        RelayReply::ConnectFailed(e.to_string())
                    }
                };
                send_reply(&state.key, circuit, &reply, back_tx)
            }
            RelayCommand::Deliver(data) => {
                let target = state.target.as_ref().ok_or_else(|| {
                    RelayError::Connection("deliver before connect".to_string())
                })?;
                target
                    .send(RelayCell::Data { payload: data })
                    .map_err(|_| RelayError::LinkClosed)?;
                Ok(())
            }
        }
    }

    /// Dial the next hop, create its circuit leg, then splice its
    /// backward cells into our own layer
    async fn extend(
        &self,
        state: &mut CircuitState,
        circuit: u64,
        address: &str,
        hop: u8,
        handshake: Vec<u8>,
        back_tx: &mpsc::UnboundedSender<RelayCell>,
    ) -> RelayResult<()> {
        if state.next.is_some() {
            return Err(RelayError::Connection("circuit already extended".to_string()));
        }

        let link = self.dialer.dial(address).await?;
        let (next_tx, mut next_rx) = pump_link(link);

        next_tx
            .send(RelayCell::Create {
                circuit,
                hop,
                handshake,
            })
            .map_err(|_| RelayError::LinkClosed)?;

        let created = tokio::time::timeout(CREATE_TIMEOUT, next_rx.recv())
            .await
            .map_err(|_| RelayError::Timeout("created"))?;
        match created {
            Some(RelayCell::Created { .. }) => {}
            Some(RelayCell::CreateFailed { reason, .. }) => {
                return Err(RelayError::HopRefused(reason));
            }
            _ => return Err(RelayError::LinkClosed),
        }

        let key = state.key.clone();
        let back = back_tx.clone();
        tokio::spawn(async move {
            while let Some(cell) = next_rx.recv().await {
                if let RelayCell::Backward { circuit, payload } = cell {
                    let Ok(wrapped) = wrap_layer(&key, &payload) else {
                        break;
                    };
                    if back
                        .send(RelayCell::Backward {
                            circuit,
                            payload: wrapped,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        state.next = Some(next_tx);
        Ok(())
    }

    /// Exit only: bridge the target connection into backward cells
    async fn connect_target(
        &self,
        state: &mut CircuitState,
        circuit: u64,
        address: &str,
        back_tx: &mpsc::UnboundedSender<RelayCell>,
    ) -> RelayResult<()> {
        if state.target.is_some() {
            return Err(RelayError::Connection("target already connected".to_string()));
        }
        let link = self.dialer.dial(address).await?;
        let (target_tx, mut target_rx) = pump_link(link);

        let key = state.key.clone();
        let back = back_tx.clone();
        tokio::spawn(async move {
            while let Some(cell) = target_rx.recv().await {
                let reply = match cell {
                    RelayCell::Data { payload } => RelayReply::Data(payload),
                    _ => continue,
                };
                if send_reply(&key, circuit, &reply, &back).is_err() {
                    break;
                }
            }
            let _ = send_reply(&key, circuit, &RelayReply::TargetClosed, &back);
        });

        state.target = Some(target_tx);
        Ok(())
    }
}

fn send_reply(
    key: &LayerKey,
    circuit: u64,
    reply: &RelayReply,
    back_tx: &mpsc::UnboundedSender<RelayCell>,
) -> RelayResult<()> {
    let sealed = wrap_layer(key, &bincode::serialize(reply)?)?;
    back_tx
        .send(RelayCell::Backward {
            circuit,
            payload: sealed,
        })
        .map_err(|_| RelayError::LinkClosed)
}

fn teardown(circuits: &mut HashMap<u64, CircuitState>, circuit: u64) {
    if let Some(state) = circuits.remove(&circuit) {
        if let Some(next) = state.next {
            let _ = next.send(RelayCell::Teardown { circuit });
        }
    }
}
