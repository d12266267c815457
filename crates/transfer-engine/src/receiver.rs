//! Receive side of a transfer
//!
//! Accepting is split in two: the engine runs the key exchange and opens
//! the sealed manifest, then hands the caller a [`PendingTransfer`] as
//! the decision point. Accepting it spawns the driver task that streams
//! chunks into the assembly, answers pings, reports progress, follows a
//! path switch announced by the sender, and finishes with the whole-file
//! hash check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crypto_session::{ChunkCipher, CryptoError, FileHasher, SessionKeys, encapsulate};
use net_transport::{
    CancelHandle, ChunkReceiver, ReceiverEvent, TransportError, cancel_pair,
};
use relay_circuit::TargetSession;
use wire_protocol::{
    ChannelId, ControlMessage, FileManifest, MAX_DATA_CHANNELS, PROTOCOL_VERSION, PeerId,
    ProtocolError, TransferId, TransferState,
};

use crate::backend::{PeerChannel, PeerLink, RelayIncoming};
use crate::benchmark::TransferReport;
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferResult};
use crate::events::TransferEvent;
use crate::session::{ControlChannel, SessionCore};

/// A decrypted, verified file with the numbers behind it
#[derive(Debug)]
pub struct ReceivedFile {
    pub manifest: FileManifest,
    pub data: Vec<u8>,
    pub report: TransferReport,
}

/// An offered transfer waiting for a local decision
pub struct PendingTransfer {
    core: Arc<SessionCore>,
    config: EngineConfig,
    control: ControlChannel,
    link: PeerLink,
    cipher: Arc<ChunkCipher>,
    keys: SessionKeys,
    manifest: FileManifest,
    peer: PeerId,
    relay: Option<RelayIncoming>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    cancel: CancelHandle,
}

impl std::fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("id", &self.core.id)
            .field("peer", &self.peer)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl PendingTransfer {
    pub fn id(&self) -> TransferId {
        self.core.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The manifest the sender sealed for this transfer. Its name comes
    /// from the peer; treat it as untrusted input when placing the file.
    pub fn manifest(&self) -> &FileManifest {
        &self.manifest
    }

    /// Take the transfer; the returned handle streams it to completion
    pub fn accept(self) -> InboundTransfer {
        let Self {
            core,
            config,
            control,
            link,
            cipher,
            keys,
            manifest,
            peer: _,
            relay,
            events,
            cancel,
        } = self;
        let id = core.id;
        let task = tokio::spawn(run_receiver(
            core, config, control, link, cipher, keys, manifest, relay,
        ));
        InboundTransfer {
            id,
            events,
            cancel,
            task,
        }
    }

    /// Decline the offer, telling the sender why
    pub async fn reject(mut self, reason: &str) -> TransferResult<()> {
        info!(transfer = %self.core.id, reason, "rejecting transfer");
        let _ = self
            .control
            .send(&ControlMessage::Reject {
                transfer_id: self.core.id,
                reason: reason.to_string(),
            })
            .await;
        self.control.close().await;
        self.core.fail(&TransferError::Cancelled);
        Ok(())
    }
}

/// Handle to a running inbound transfer
pub struct InboundTransfer {
    id: TransferId,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    cancel: CancelHandle,
    task: JoinHandle<TransferResult<ReceivedFile>>,
}

impl InboundTransfer {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Ask the transfer to stop; the sender is told and the partial
    /// assembly is dropped
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next progress event; `None` once the driver has finished
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Wait for the verified file
    pub async fn finish(self) -> TransferResult<ReceivedFile> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Resource(
                "receiver task failed".to_string(),
            )),
        }
    }
}

/// Run the handshake far enough to put a decision in front of the
/// caller: exchange keys, open the manifest, enforce the local caps
pub(crate) async fn accept_handshake(
    config: EngineConfig,
    mut link: PeerLink,
    relay: Option<RelayIncoming>,
) -> TransferResult<PendingTransfer> {
    let mut control = ControlChannel::new(link.accept_channel().await?);
    let offer = control
        .recv_timeout(config.handshake_timeout, "key offer")
        .await?;
    let ControlMessage::KeyOffer {
        transfer_id,
        peer_id,
        protocol_version,
        kem_public,
        ec_public,
    } = offer
    else {
        return Err(ProtocolError::UnexpectedMessage("key offer").into());
    };
    if protocol_version != PROTOCOL_VERSION {
        let _ = control
            .send(&ControlMessage::Reject {
                transfer_id,
                reason: format!("unsupported protocol version {protocol_version}"),
            })
            .await;
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: protocol_version,
        }
        .into());
    }

    let (cancel_handle, cancel) = cancel_pair();
    let (events_tx, events) = mpsc::unbounded_channel();
    let core = SessionCore::new(transfer_id, config.adaptive.clone(), cancel, events_tx);
    core.transition(TransferState::KeyExchange)?;

    let (ciphertext, secret) = encapsulate(&kem_public, &ec_public)?;
    control
        .send(&ControlMessage::KeyAnswer {
            transfer_id,
            ciphertext: ciphertext.to_bytes(),
        })
        .await?;
    let keys = SessionKeys::derive(&secret)?;
    let cipher = Arc::new(ChunkCipher::new(&keys)?);
    core.transition(TransferState::Negotiating)?;

    let message = control
        .recv_timeout(config.handshake_timeout, "manifest")
        .await?;
    let ControlMessage::Manifest {
        transfer_id: manifest_id,
        nonce,
        sealed,
    } = message
    else {
        return Err(ProtocolError::UnexpectedMessage("manifest").into());
    };
    if manifest_id != transfer_id {
        return Err(ProtocolError::UnexpectedMessage("manifest").into());
    }
    let manifest = cipher.open_manifest(&sealed, nonce)?;

    if manifest.total_chunks == 0 || manifest.size == 0 {
        let _ = control
            .send(&ControlMessage::Reject {
                transfer_id,
                reason: "empty transfer".to_string(),
            })
            .await;
        return Err(CryptoError::EmptyPlaintext.into());
    }
    if manifest.size > config.max_file_size {
        let reason = format!(
            "file of {} bytes exceeds the {} byte cap",
            manifest.size, config.max_file_size
        );
        let _ = control
            .send(&ControlMessage::Reject {
                transfer_id,
                reason: reason.clone(),
            })
            .await;
        return Err(TransferError::Resource(reason));
    }

    info!(
        transfer = %transfer_id,
        peer = %peer_id,
        name = %manifest.name,
        size = manifest.size,
        total_chunks = manifest.total_chunks,
        "transfer offered"
    );
    Ok(PendingTransfer {
        core,
        config,
        control,
        link,
        cipher,
        keys,
        manifest,
        peer: peer_id,
        relay,
        events,
        cancel: cancel_handle,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_receiver(
    core: Arc<SessionCore>,
    config: EngineConfig,
    control: ControlChannel,
    link: PeerLink,
    cipher: Arc<ChunkCipher>,
    keys: SessionKeys,
    manifest: FileManifest,
    relay: Option<RelayIncoming>,
) -> TransferResult<ReceivedFile> {
    let result = drive(
        core.clone(),
        config,
        control,
        link,
        cipher,
        keys,
        manifest,
        relay,
    )
    .await;
    if let Err(err) = &result {
        core.fail(err);
    }
    result
}

/// What ended a streaming leg, short of an error
enum LegEnd {
    Complete(Vec<u8>),
    /// The sender announced a relayed restart
    Switch,
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    core: Arc<SessionCore>,
    config: EngineConfig,
    mut control: ControlChannel,
    mut link: PeerLink,
    cipher: Arc<ChunkCipher>,
    keys: SessionKeys,
    manifest: FileManifest,
    mut relay: Option<RelayIncoming>,
) -> TransferResult<ReceivedFile> {
    let granted = config.data_channels.clamp(1, MAX_DATA_CHANNELS as u8);
    control
        .send(&ControlMessage::Accept {
            transfer_id: core.id,
            data_channels: granted,
        })
        .await?;

    let mut fallback_used = false;
    let mut _session_guard: Option<TargetSession> = None;
    let mut pending_leg: Option<Vec<PeerChannel>> = None;

    let bytes = loop {
        let channels = match pending_leg.take() {
            Some(channels) => Ok(channels),
            None => accept_data_channels(&mut link, granted as usize, &config).await,
        };
        let outcome = match channels {
            Ok(channels) => {
                receive_leg(&core, &config, &mut control, channels, &cipher, &manifest).await
            }
            Err(err) => Err(err),
        };
        // A leg ends three ways short of completion: the sender announced
        // a relayed restart, the path died under us, or the session
        // itself is unsound. Only the first two continue, and only once.
        let reason = match outcome {
            Ok(LegEnd::Complete(bytes)) => break bytes,
            Ok(LegEnd::Switch) => None,
            Err(err) if err.is_path_failure() => Some(err),
            Err(err) => return Err(err),
        };
        let switch_dead_end = || {
            TransferError::from(TransportError::ConnectionClosed(
                "path switch without a usable relay".to_string(),
            ))
        };
        let Some(incoming) = relay.as_mut() else {
            return Err(reason.unwrap_or_else(switch_dead_end));
        };
        if fallback_used {
            return Err(reason.unwrap_or_else(switch_dead_end));
        }
        fallback_used = true;
        match &reason {
            Some(err) => warn!(
                transfer = %core.id,
                error = %err,
                "direct path failed, waiting for relayed session"
            ),
            None => info!(transfer = %core.id, "sender announced a path switch"),
        }
        let (new_control, channels, session) =
            accept_relay_leg(&core, &config, incoming, granted).await?;
        control = new_control;
        pending_leg = Some(channels);
        _session_guard = Some(session);
    };

    core.transition(TransferState::Verifying)?;
    let ok = bytes.len() as u64 == manifest.size && {
        let mut hasher = FileHasher::new(&keys);
        hasher.update(&bytes);
        hasher.finalize() == manifest.file_hash
    };
    control
        .send(&ControlMessage::VerifyResult {
            transfer_id: core.id,
            ok,
        })
        .await?;
    if !ok {
        return Err(CryptoError::ContentHashMismatch.into());
    }

    core.transition(TransferState::Complete)?;
    let report = core.finish_report();
    core.emit(TransferEvent::Completed(report.clone()));
    info!(
        transfer = %core.id,
        bytes = report.bytes_moved,
        relay = report.relay_used,
        "file received and verified"
    );
    control.close().await;
    link.close("transfer complete");
    Ok(ReceivedFile {
        manifest,
        data: bytes,
        report,
    })
}

async fn accept_data_channels(
    link: &mut PeerLink,
    count: usize,
    config: &EngineConfig,
) -> TransferResult<Vec<PeerChannel>> {
    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        let channel = tokio::time::timeout(config.handshake_timeout, link.accept_channel())
            .await
            .map_err(|_| TransferError::Timeout("data channels"))??;
        channels.push(channel);
    }
    Ok(channels)
}

/// Stream one leg's chunks into a fresh assembly. A switch announced on
/// the control channel ends the leg cleanly; the partial assembly is
/// dropped with the leg because the sender restreams from the first
/// chunk on the new path.
async fn receive_leg(
    core: &Arc<SessionCore>,
    config: &EngineConfig,
    control: &mut ControlChannel,
    channels: Vec<PeerChannel>,
    cipher: &Arc<ChunkCipher>,
    manifest: &FileManifest,
) -> TransferResult<LegEnd> {
    if core.state() == TransferState::Negotiating {
        core.transition(TransferState::Transferring)?;
    }

    let (leg_cancel, leg_token) = cancel_pair();
    let mut receiver = ChunkReceiver::start(
        channels,
        cipher.clone(),
        manifest.total_chunks,
        manifest.size,
        leg_token,
    );
    let assembly = receiver.assembly();

    let mut feedback = tokio::time::interval(config.feedback_interval);
    feedback.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let watchdog_tick = (config.stall_timeout / 4).max(Duration::from_millis(50));
    let mut watchdog = tokio::time::interval(watchdog_tick);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_chunk = Instant::now();

    enum Inner {
        Complete,
        Switch,
    }

    let ended: TransferResult<Inner> = loop {
        tokio::select! {
            _ = core.cancel.cancelled() => {
                let _ = control
                    .send(&ControlMessage::Cancel {
                        transfer_id: core.id,
                        reason: "cancelled by receiver".to_string(),
                    })
                    .await;
                break Err(TransferError::Cancelled);
            }
            event = receiver.next_event() => match event {
                Some(ReceiverEvent::Chunk { index, bytes }) => {
                    last_chunk = Instant::now();
                    core.benchmark.lock().record_chunk(bytes, false);
                    debug!(transfer = %core.id, index, bytes, "chunk landed");
                }
                Some(ReceiverEvent::Complete) => break Ok(Inner::Complete),
                Some(ReceiverEvent::ChannelClosed(id)) => {
                    warn!(transfer = %core.id, channel = %id, "data channel closed early");
                }
                Some(ReceiverEvent::Protocol(err)) => break Err(err.into()),
                Some(ReceiverEvent::Crypto(err)) => break Err(err.into()),
                Some(ReceiverEvent::OverCapacity { bytes, max }) => {
                    break Err(TransferError::Resource(format!(
                        "assembly of {bytes} bytes exceeds the {max} byte cap"
                    )));
                }
                None => break Err(TransportError::AllChannelsFailed.into()),
            },
            received = control.recv() => match received {
                Err(err) => break Err(err),
                Ok(None) => break Err(TransportError::ConnectionClosed(
                    "control channel closed mid-transfer".to_string(),
                )
                .into()),
                Ok(Some(message)) => match message {
                    ControlMessage::Ping { seq, timestamp_us } => {
                        let pong = ControlMessage::Pong {
                            seq,
                            ping_timestamp_us: timestamp_us,
                        };
                        if let Err(err) = control.send(&pong).await {
                            break Err(err);
                        }
                    }
                    ControlMessage::SendDone { chunks_sent, .. } => {
                        if chunks_sent != manifest.total_chunks {
                            break Err(ProtocolError::TotalMismatch {
                                declared: manifest.total_chunks,
                                got: chunks_sent,
                            }
                            .into());
                        }
                        // Stragglers may still be in flight; keep going
                        // until the assembly itself reports complete.
                    }
                    ControlMessage::Reconnect { transfer_id, .. } if transfer_id == core.id => {
                        break Ok(Inner::Switch);
                    }
                    ControlMessage::Cancel { reason, .. } => {
                        info!(transfer = %core.id, reason, "peer cancelled transfer");
                        break Err(TransferError::Cancelled);
                    }
                    _ => break Err(ProtocolError::UnexpectedMessage("chunk streaming").into()),
                },
            },
            _ = feedback.tick() => {
                let snapshot = ControlMessage::Feedback {
                    transfer_id: core.id,
                    chunks_received: assembly.received(),
                    highest_index: assembly.highest_index().unwrap_or(0),
                    bytes_received: assembly.bytes_received(),
                };
                if let Err(err) = control.send(&snapshot).await {
                    break Err(err);
                }
                core.emit(TransferEvent::Progress {
                    bytes: assembly.bytes_received(),
                    chunks: assembly.received(),
                    total_chunks: manifest.total_chunks,
                });
            }
            _ = watchdog.tick() => {
                if last_chunk.elapsed() >= config.stall_timeout {
                    break Err(TransferError::Timeout("chunk arrival"));
                }
            }
        }
    };

    match ended {
        Ok(Inner::Complete) => {
            core.emit(TransferEvent::Progress {
                bytes: assembly.bytes_received(),
                chunks: assembly.received(),
                total_chunks: manifest.total_chunks,
            });
            let bytes = assembly.assemble()?;
            Ok(LegEnd::Complete(bytes))
        }
        Ok(Inner::Switch) => {
            leg_cancel.cancel();
            info!(
                transfer = %core.id,
                discarded_chunks = assembly.received(),
                "dropping partial assembly for the relayed restart"
            );
            drop(receiver);
            Ok(LegEnd::Switch)
        }
        Err(err) => {
            leg_cancel.cancel();
            Err(err)
        }
    }
}

/// Take the next relayed session and redo the channel negotiation over
/// it. The greeting is the same `Reconnect` the sender said goodbye
/// with; the channel count is negotiated fresh because the path changed.
async fn accept_relay_leg(
    core: &Arc<SessionCore>,
    config: &EngineConfig,
    incoming: &mut RelayIncoming,
    granted_cap: u8,
) -> TransferResult<(ControlChannel, Vec<PeerChannel>, TargetSession)> {
    let mut session = tokio::time::timeout(config.handshake_timeout, incoming.recv())
        .await
        .map_err(|_| TransferError::Timeout("relay session"))?
        .ok_or_else(|| {
            TransportError::ConnectionClosed("relay listener closed".to_string())
        })?;
    let channel = tokio::time::timeout(config.handshake_timeout, session.accept_channel())
        .await
        .map_err(|_| TransferError::Timeout("relay control channel"))?
        .ok_or(TransportError::ChannelClosed(ChannelId::CONTROL))?;
    let mut control = ControlChannel::new(PeerChannel::Relay(channel));

    let greeting = control
        .recv_timeout(config.handshake_timeout, "relay greeting")
        .await?;
    let proposal = match greeting {
        ControlMessage::Reconnect {
            transfer_id,
            data_channels,
        } if transfer_id == core.id => data_channels,
        _ => return Err(ProtocolError::UnexpectedMessage("relay greeting").into()),
    };
    let granted = proposal
        .min(granted_cap)
        .clamp(1, MAX_DATA_CHANNELS as u8);
    control
        .send(&ControlMessage::Accept {
            transfer_id: core.id,
            data_channels: granted,
        })
        .await?;

    let mut channels = Vec::with_capacity(granted as usize);
    for _ in 0..granted {
        let channel = tokio::time::timeout(config.handshake_timeout, session.accept_channel())
            .await
            .map_err(|_| TransferError::Timeout("relay data channels"))?
            .ok_or(TransportError::AllChannelsFailed)?;
        channels.push(PeerChannel::Relay(channel));
    }

    core.benchmark.lock().mark_relay();
    core.emit(TransferEvent::PathSwitched { route: Vec::new() });
    info!(transfer = %core.id, channels = granted, "accepted relayed path");
    Ok((control, channels, session))
}
