//! Send side of a transfer
//!
//! One driver task per outbound transfer walks the full state machine:
//! hybrid key exchange, manifest negotiation, parallel chunk streaming
//! with a ping loop feeding the adaptive controller, then the verify
//! handshake. Chunks are pumped by a separate task so control traffic
//! stays responsive while sends park on the watermarks. If the direct
//! path dies mid-stream the driver swaps every channel onto a relay
//! circuit once and restreams from the first chunk; the receive side
//! discards partial assembly on the switch, and the nonce sequence keeps
//! counting monotonically across the re-encryption.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crypto_session::{
    ChunkCipher, CryptoError, Direction, FileHasher, HybridKeyPair, NonceSequence, SessionKeys,
    decapsulate,
};
use net_transport::{CancelHandle, ChunkSender, MetricSample, TransportError, cancel_pair};
use relay_circuit::RelayConnection;
use wire_protocol::{
    ChannelId, ControlMessage, FileManifest, MAX_DATA_CHANNELS, PROTOCOL_VERSION, PeerId,
    ProtocolError, TransferId, TransferState,
};

use crate::backend::{PeerChannel, PeerLink, RelayClient, loss_fraction};
use crate::benchmark::TransferReport;
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferResult};
use crate::events::TransferEvent;
use crate::session::{ControlChannel, SessionClock, SessionCore, TransferPayload};

/// Handle to a running outbound transfer
pub struct OutboundTransfer {
    id: TransferId,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    cancel: CancelHandle,
    task: JoinHandle<TransferResult<TransferReport>>,
}

impl OutboundTransfer {
    pub(crate) fn new(
        id: TransferId,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        cancel: CancelHandle,
        task: JoinHandle<TransferResult<TransferReport>>,
    ) -> Self {
        Self {
            id,
            events,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Ask the transfer to stop. Sends are cut at the next chunk
    /// boundary and the peer is told; the final result is `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next progress event; `None` once the driver has finished
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal result
    pub async fn finish(self) -> TransferResult<TransferReport> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Resource(
                "sender task failed".to_string(),
            )),
        }
    }
}

/// Everything a streaming leg needs regardless of which path carries it
#[derive(Clone)]
struct SenderShared {
    core: Arc<SessionCore>,
    config: EngineConfig,
    clock: SessionClock,
    plan: ChunkPlan,
    cipher: Arc<ChunkCipher>,
    nonces: Arc<Mutex<NonceSequence>>,
}

/// Chunk grid fixed at manifest time: uniform chunks except the final
/// remainder, so indices alone place every chunk in the file
#[derive(Clone)]
struct ChunkPlan {
    data: Bytes,
    chunk_size: usize,
    total: u32,
}

pub(crate) async fn run_sender(
    core: Arc<SessionCore>,
    config: EngineConfig,
    peer_id: PeerId,
    link: PeerLink,
    payload: TransferPayload,
    relay: Option<RelayClient>,
) -> TransferResult<TransferReport> {
    let result = drive(core.clone(), config, peer_id, link, payload, relay).await;
    if let Err(err) = &result {
        core.fail(err);
    }
    result
}

async fn drive(
    core: Arc<SessionCore>,
    config: EngineConfig,
    peer_id: PeerId,
    link: PeerLink,
    payload: TransferPayload,
    relay: Option<RelayClient>,
) -> TransferResult<TransferReport> {
    if payload.data.is_empty() {
        return Err(CryptoError::EmptyPlaintext.into());
    }

    core.transition(TransferState::KeyExchange)?;
    let mut control = ControlChannel::new(link.open_channel(ChannelId::CONTROL).await?);

    let keypair = HybridKeyPair::generate();
    control
        .send(&ControlMessage::KeyOffer {
            transfer_id: core.id,
            peer_id,
            protocol_version: PROTOCOL_VERSION,
            kem_public: keypair.kem_public_bytes().to_vec(),
            ec_public: keypair.ec_public_bytes(),
        })
        .await?;

    let keys = match control
        .recv_timeout(config.handshake_timeout, "key answer")
        .await?
    {
        ControlMessage::KeyAnswer {
            transfer_id,
            ciphertext,
        } if transfer_id == core.id => {
            let secret = decapsulate(&ciphertext, &keypair)?;
            SessionKeys::derive(&secret)?
        }
        ControlMessage::Reject { reason, .. } => {
            return Err(ProtocolError::Rejected(reason).into());
        }
        _ => return Err(ProtocolError::UnexpectedMessage("key answer").into()),
    };
    let cipher = Arc::new(ChunkCipher::new(&keys)?);
    let nonces = Arc::new(Mutex::new(NonceSequence::new(Direction::Initiator)));
    core.transition(TransferState::Negotiating)?;

    // The chunk grid is fixed for the whole transfer here; adaptation
    // steers the channel count of later legs and the size of the next
    // transfer, never a grid already promised in a manifest.
    let chunk_size = core.controller.current_params().chunk_size;
    let total_chunks = payload.data.len().div_ceil(chunk_size) as u32;
    let mut hasher = FileHasher::new(&keys);
    hasher.update(&payload.data);
    let manifest = FileManifest {
        name: payload.name.clone(),
        size: payload.data.len() as u64,
        mime: payload.mime.clone(),
        total_chunks,
        file_hash: hasher.finalize(),
    };
    let manifest_nonce = { nonces.lock().next()? };
    let sealed = cipher.seal_manifest(&manifest, manifest_nonce)?;
    control
        .send(&ControlMessage::Manifest {
            transfer_id: core.id,
            nonce: manifest_nonce,
            sealed,
        })
        .await?;

    let granted = match control
        .recv_timeout(config.handshake_timeout, "transfer acceptance")
        .await?
    {
        ControlMessage::Accept {
            transfer_id,
            data_channels,
        } if transfer_id == core.id => (data_channels as usize).clamp(1, MAX_DATA_CHANNELS),
        ControlMessage::Reject { reason, .. } => {
            return Err(ProtocolError::Rejected(reason).into());
        }
        _ => return Err(ProtocolError::UnexpectedMessage("transfer acceptance").into()),
    };
    info!(
        transfer = %core.id,
        total_chunks,
        chunk_size,
        channels = granted,
        "transfer accepted"
    );

    let shared = SenderShared {
        core: core.clone(),
        config: config.clone(),
        clock: SessionClock::start(),
        plan: ChunkPlan {
            data: payload.data.clone(),
            chunk_size,
            total: total_chunks,
        },
        cipher,
        nonces,
    };

    let mut fallback_used = false;
    let mut _relay_guard: Option<RelayConnection> = None;
    let mut pending_channels: Option<Vec<PeerChannel>> = None;

    let report = loop {
        let channels = match pending_channels.take() {
            Some(channels) => Ok(channels),
            None => open_data_channels(&link, granted).await,
        };
        let outcome = match channels {
            Ok(channels) => {
                stream_leg(&shared, &link, &mut control, channels, fallback_used).await
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(report) => break report,
            Err(err) => match relay.as_ref() {
                Some(client) if err.is_path_failure() && !fallback_used => {
                    fallback_used = true;
                    warn!(
                        transfer = %core.id,
                        error = %err,
                        "direct path failed, falling back to relay"
                    );
                    let (new_control, channels, connection) =
                        switch_to_relay(&shared, client, &mut control).await?;
                    control = new_control;
                    pending_channels = Some(channels);
                    _relay_guard = Some(connection);
                }
                _ => return Err(err),
            },
        }
    };

    if let Some(connection) = _relay_guard.take() {
        connection.close();
    }
    link.close("transfer complete");
    Ok(report)
}

async fn open_data_channels(link: &PeerLink, count: usize) -> TransferResult<Vec<PeerChannel>> {
    let mut channels = Vec::with_capacity(count);
    for index in 0..count as u8 {
        channels.push(link.open_channel(ChannelId::data(index)).await?);
    }
    Ok(channels)
}

/// Stream the whole chunk plan over one set of channels and run the
/// verify handshake. Any error leaves the pump cancelled; path failures
/// are the caller's cue to try the relay.
async fn stream_leg(
    shared: &SenderShared,
    link: &PeerLink,
    control: &mut ControlChannel,
    channels: Vec<PeerChannel>,
    relayed: bool,
) -> TransferResult<TransferReport> {
    let core = &shared.core;
    let config = &shared.config;
    if core.state() == TransferState::Negotiating {
        core.transition(TransferState::Transferring)?;
    }

    let (pump_cancel, pump_token) = cancel_pair();
    let chunk_sender = ChunkSender::new(channels, config.limits, pump_token);
    let buffered = Arc::new(AtomicUsize::new(0));
    let mut pump = tokio::spawn(pump_chunks(chunk_sender, shared.clone(), buffered.clone()));

    let mut ping = tokio::time::interval(config.metrics_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let watchdog_tick = (config.stall_timeout / 4).max(Duration::from_millis(50));
    let mut watchdog = tokio::time::interval(watchdog_tick);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut seq = 0u64;
    let mut last_progress = Instant::now();
    let mut last_feedback_bytes = 0u64;
    let mut early_verdict: Option<bool> = None;

    let streamed: TransferResult<u32> = loop {
        tokio::select! {
            _ = core.cancel.cancelled() => {
                let _ = control
                    .send(&ControlMessage::Cancel {
                        transfer_id: core.id,
                        reason: "cancelled by sender".to_string(),
                    })
                    .await;
                break Err(TransferError::Cancelled);
            }
            joined = &mut pump => {
                break match joined {
                    Ok(result) => result,
                    Err(_) => Err(TransferError::Resource("chunk pump task failed".to_string())),
                };
            }
            received = control.recv() => match received {
                Err(err) => break Err(err),
                Ok(None) => break Err(TransportError::ConnectionClosed(
                    "control channel closed mid-transfer".to_string(),
                )
                .into()),
                Ok(Some(message)) => match message {
                    ControlMessage::Feedback {
                        chunks_received,
                        bytes_received,
                        ..
                    } => {
                        if bytes_received > last_feedback_bytes {
                            last_feedback_bytes = bytes_received;
                            last_progress = Instant::now();
                        }
                        core.emit(TransferEvent::Progress {
                            bytes: bytes_received,
                            chunks: chunks_received,
                            total_chunks: shared.plan.total,
                        });
                    }
                    ControlMessage::Pong { ping_timestamp_us, .. } => {
                        record_path_sample(shared, link, relayed, ping_timestamp_us, &buffered);
                    }
                    ControlMessage::VerifyResult { ok, .. } => {
                        // The receiver can finish while the pump's tail is
                        // still draining local queues.
                        early_verdict = Some(ok);
                    }
                    ControlMessage::Cancel { reason, .. } => {
                        info!(transfer = %core.id, reason, "peer cancelled transfer");
                        break Err(TransferError::Cancelled);
                    }
                    _ => break Err(ProtocolError::UnexpectedMessage("chunk streaming").into()),
                },
            },
            _ = ping.tick() => {
                seq += 1;
                let ping_msg = ControlMessage::Ping {
                    seq,
                    timestamp_us: shared.clock.now_us(),
                };
                if let Err(err) = control.send(&ping_msg).await {
                    break Err(err);
                }
            }
            _ = watchdog.tick() => {
                if last_progress.elapsed() >= config.stall_timeout {
                    break Err(TransferError::Timeout("chunk progress"));
                }
            }
        }
    };

    let chunks_sent = match streamed {
        Ok(count) => count,
        Err(err) => {
            pump_cancel.cancel();
            pump.abort();
            return Err(err);
        }
    };

    control
        .send(&ControlMessage::SendDone {
            transfer_id: core.id,
            chunks_sent,
        })
        .await?;
    if core.state() == TransferState::Transferring {
        core.transition(TransferState::Verifying)?;
    }

    let ok = match early_verdict {
        Some(ok) => ok,
        None => await_verdict(shared, link, control, relayed, &buffered).await?,
    };
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
        "transfer complete"
    );
    Ok(report)
}

/// Wait for the receiver's verdict, still answering progress and pong
/// traffic that was in flight when the last chunk went out
async fn await_verdict(
    shared: &SenderShared,
    link: &PeerLink,
    control: &mut ControlChannel,
    relayed: bool,
    buffered: &Arc<AtomicUsize>,
) -> TransferResult<bool> {
    loop {
        match control
            .recv_timeout(shared.config.handshake_timeout, "verification")
            .await?
        {
            ControlMessage::VerifyResult { ok, .. } => return Ok(ok),
            ControlMessage::Feedback {
                chunks_received,
                bytes_received,
                ..
            } => {
                shared.core.emit(TransferEvent::Progress {
                    bytes: bytes_received,
                    chunks: chunks_received,
                    total_chunks: shared.plan.total,
                });
            }
            ControlMessage::Pong {
                ping_timestamp_us, ..
            } => {
                record_path_sample(shared, link, relayed, ping_timestamp_us, buffered);
            }
            ControlMessage::Cancel { reason, .. } => {
                info!(transfer = %shared.core.id, reason, "peer cancelled transfer");
                return Err(TransferError::Cancelled);
            }
            _ => return Err(ProtocolError::UnexpectedMessage("verification").into()),
        }
    }
}

/// Feed one pong into the controller and the benchmark. Loss comes from
/// the link's packet counters on the direct path; a circuit exposes
/// none, so the relayed leg reports only what it can see.
fn record_path_sample(
    shared: &SenderShared,
    link: &PeerLink,
    relayed: bool,
    ping_timestamp_us: u64,
    buffered: &Arc<AtomicUsize>,
) {
    let rtt = shared.clock.rtt_from(ping_timestamp_us);
    let loss = if relayed {
        0.0
    } else {
        link.stats().map(|s| loss_fraction(&s)).unwrap_or(0.0)
    };
    shared.core.controller.record(MetricSample {
        rtt,
        loss,
        buffered_bytes: buffered.load(Ordering::Relaxed),
    });
    let mut bench = shared.core.benchmark.lock();
    bench.record_rtt(rtt);
    bench.record_loss(shared.core.controller.smoothed_loss());
}

/// Encrypt and dispatch every chunk in the plan, then flush. Encryption
/// is serial because the nonce sequence is; the parallelism lives in the
/// channels underneath.
async fn pump_chunks(
    mut sender: ChunkSender<PeerChannel>,
    shared: SenderShared,
    buffered: Arc<AtomicUsize>,
) -> TransferResult<u32> {
    let plan = &shared.plan;
    let high_watermark = shared.config.limits.high_watermark;
    for index in 0..plan.total {
        let start = index as usize * plan.chunk_size;
        let end = (start + plan.chunk_size).min(plan.data.len());
        let nonce = { shared.nonces.lock().next()? };
        let chunk = shared
            .cipher
            .encrypt_chunk(&plan.data[start..end], index, plan.total, nonce)?;
        let backpressured = sender.buffered_total() >= high_watermark;
        sender.send_chunk(&chunk).await?;
        shared
            .core
            .benchmark
            .lock()
            .record_chunk((end - start) as u64, backpressured);
        buffered.store(sender.buffered_total(), Ordering::Relaxed);
    }
    sender.close_all().await;
    debug!(transfer = %shared.core.id, chunks = plan.total, "chunk pump finished");
    Ok(plan.total)
}

/// Tear down the direct leg and negotiate a relayed one. The farewell on
/// the old control channel is best effort; if that side is what died,
/// the receiver discovers the switch from its own stall instead.
async fn switch_to_relay(
    shared: &SenderShared,
    client: &RelayClient,
    old_control: &mut ControlChannel,
) -> TransferResult<(ControlChannel, Vec<PeerChannel>, RelayConnection)> {
    let core = &shared.core;
    let proposal =
        (core.controller.current_params().channel_count as usize).clamp(1, MAX_DATA_CHANNELS) as u8;
    let reconnect = ControlMessage::Reconnect {
        transfer_id: core.id,
        data_channels: proposal,
    };
    let _ = tokio::time::timeout(Duration::from_millis(250), old_control.send(&reconnect)).await;
    old_control.close().await;

    let connection = client.connect().await?;
    let mut control = ControlChannel::new(PeerChannel::Relay(
        connection.open_channel(ChannelId::CONTROL),
    ));
    control.send(&reconnect).await?;
    let granted = match control
        .recv_timeout(shared.config.handshake_timeout, "relay acceptance")
        .await?
    {
        ControlMessage::Accept {
            transfer_id,
            data_channels,
        } if transfer_id == core.id => (data_channels as usize).clamp(1, MAX_DATA_CHANNELS),
        ControlMessage::Reject { reason, .. } => {
            return Err(ProtocolError::Rejected(reason).into());
        }
        _ => return Err(ProtocolError::UnexpectedMessage("relay acceptance").into()),
    };
    let channels = (0..granted as u8)
        .map(|index| PeerChannel::Relay(connection.open_channel(ChannelId::data(index))))
        .collect();
    core.benchmark.lock().mark_relay();
    core.emit(TransferEvent::PathSwitched {
        route: connection.route().to_vec(),
    });
    info!(
        transfer = %core.id,
        hops = connection.route().len(),
        channels = granted,
        "switched to relay circuit"
    );
    Ok((control, channels, connection))
}
