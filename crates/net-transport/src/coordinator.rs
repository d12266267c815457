//! Multi-channel chunk coordination
//!
//! The sender spreads encrypted chunks round-robin over every channel
//! that is open and below its high watermark; when all are saturated it
//! parks until one drains. The receiver runs one pump task per channel,
//! decrypts in parallel, and slots plaintext into a shared assembly
//! keyed by chunk index so delivery order never matters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use crypto_session::{ChunkCipher, CryptoError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wire_protocol::{ChannelId, EncryptedChunk, ProtocolError, ProtocolResult};

use crate::{CancelToken, ChannelLimits, FrameChannel, TransportError, TransportResult};

struct Slot<C> {
    channel: C,
    paused: bool,
}

/// Fans encrypted chunks out across the open data channels
pub struct ChunkSender<C> {
    slots: Vec<Slot<C>>,
    limits: ChannelLimits,
    cursor: usize,
    cancel: CancelToken,
    chunks_sent: u32,
    bytes_sent: u64,
}

impl<C: FrameChannel> ChunkSender<C> {
    pub fn new(channels: Vec<C>, limits: ChannelLimits, cancel: CancelToken) -> Self {
        let slots = channels
            .into_iter()
            .map(|channel| Slot {
                channel,
                paused: false,
            })
            .collect();
        Self {
            slots,
            limits,
            cursor: 0,
            cancel,
            chunks_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Queue one chunk on the next available channel.
    ///
    /// Blocks while every open channel sits above its high watermark and
    /// resumes once one drains below the low watermark. Chunks are never
    /// dropped; the only exits are success, cancellation, or running out
    /// of channels.
    pub async fn send_chunk(&mut self, chunk: &EncryptedChunk) -> TransportResult<()> {
        let frame = chunk.encode();
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let before = self.slots.len();
            self.slots.retain(|slot| slot.channel.is_open());
            if self.slots.len() < before {
                warn!(
                    dropped = before - self.slots.len(),
                    remaining = self.slots.len(),
                    "data channel left rotation"
                );
            }
            if self.slots.is_empty() {
                return Err(TransportError::AllChannelsFailed);
            }
            if self.cursor >= self.slots.len() {
                self.cursor = 0;
            }

            // Pause at the high watermark, resume only below the low one.
            for slot in &mut self.slots {
                let buffered = slot.channel.buffered_amount();
                if slot.paused {
                    if buffered < self.limits.low_watermark {
                        slot.paused = false;
                    }
                } else if buffered >= self.limits.high_watermark {
                    debug!(channel = %slot.channel.id(), buffered, "channel saturated, pausing");
                    slot.paused = true;
                }
            }

            let len = self.slots.len();
            let picked = (0..len)
                .map(|offset| (self.cursor + offset) % len)
                .find(|&idx| !self.slots[idx].paused);

            match picked {
                Some(idx) => match self.slots[idx].channel.send(frame.clone()).await {
                    Ok(()) => {
                        self.cursor = (idx + 1) % len;
                        self.chunks_sent += 1;
                        self.bytes_sent += frame.len() as u64;
                        return Ok(());
                    }
                    Err(TransportError::ChannelClosed(_)) => continue,
                    Err(err) => return Err(err),
                },
                None => {
                    let drains = self
                        .slots
                        .iter()
                        .map(|slot| Box::pin(slot.channel.drained()));
                    tokio::select! {
                        _ = futures::future::select_all(drains) => {}
                        _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                    }
                }
            }
        }
    }

    pub fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn active_channels(&self) -> usize {
        self.slots.iter().filter(|s| s.channel.is_open()).count()
    }

    /// Bytes currently queued across all channels
    pub fn buffered_total(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.channel.buffered_amount())
            .sum()
    }

    pub async fn close_all(&mut self) {
        for slot in &mut self.slots {
            slot.channel.close().await;
        }
        self.slots.clear();
    }
}

/// Shared out-of-order reassembly state
pub struct ChunkAssembly {
    total: u32,
    max_bytes: u64,
    slots: DashMap<u32, Bytes>,
    received: AtomicU32,
    bytes: AtomicU64,
}

impl ChunkAssembly {
    pub fn new(total: u32, max_bytes: u64) -> Self {
        Self {
            total,
            max_bytes,
            slots: DashMap::new(),
            received: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn received(&self) -> u32 {
        self.received.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total
    }

    /// Highest contiguous index received so far, if any
    pub fn highest_index(&self) -> Option<u32> {
        self.slots.iter().map(|entry| *entry.key()).max()
    }

    /// Slot a decrypted chunk; returns true when the file is complete
    fn insert(&self, index: u32, plaintext: Bytes) -> ProtocolResult<bool> {
        if index >= self.total {
            return Err(ProtocolError::InvalidChunkIndex {
                index,
                total: self.total,
            });
        }
        let len = plaintext.len() as u64;
        match self.slots.entry(index) {
            Entry::Occupied(_) => return Err(ProtocolError::DuplicateChunk(index)),
            Entry::Vacant(vacant) => {
                vacant.insert(plaintext);
            }
        }
        let received = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        self.bytes.fetch_add(len, Ordering::AcqRel);
        Ok(received == self.total)
    }

    /// Drain the slots into one ordered buffer
    pub fn assemble(&self) -> ProtocolResult<Vec<u8>> {
        if !self.is_complete() {
            return Err(ProtocolError::IncompleteAssembly {
                received: self.received(),
                total: self.total,
            });
        }
        let mut out = Vec::with_capacity(self.bytes_received() as usize);
        for index in 0..self.total {
            let (_, chunk) =
                self.slots
                    .remove(&index)
                    .ok_or(ProtocolError::IncompleteAssembly {
                        received: index,
                        total: self.total,
                    })?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// What the receive pumps report back to the transfer loop
#[derive(Debug)]
pub enum ReceiverEvent {
    Chunk { index: u32, bytes: u64 },
    Complete,
    ChannelClosed(ChannelId),
    Protocol(ProtocolError),
    Crypto(CryptoError),
    OverCapacity { bytes: u64, max: u64 },
}

/// Drives per-channel receive pumps into a shared [`ChunkAssembly`]
pub struct ChunkReceiver {
    assembly: Arc<ChunkAssembly>,
    events: mpsc::UnboundedReceiver<ReceiverEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChunkReceiver {
    pub fn start<C>(
        channels: Vec<C>,
        cipher: Arc<ChunkCipher>,
        total: u32,
        max_bytes: u64,
        cancel: CancelToken,
    ) -> Self
    where
        C: FrameChannel + Send + 'static,
    {
        let assembly = Arc::new(ChunkAssembly::new(total, max_bytes));
        let (events_tx, events) = mpsc::unbounded_channel();
        let tasks = channels
            .into_iter()
            .map(|channel| {
                tokio::spawn(pump(
                    channel,
                    cipher.clone(),
                    assembly.clone(),
                    events_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        Self {
            assembly,
            events,
            tasks,
        }
    }

    pub async fn next_event(&mut self) -> Option<ReceiverEvent> {
        self.events.recv().await
    }

    pub fn assembly(&self) -> Arc<ChunkAssembly> {
        self.assembly.clone()
    }
}

impl Drop for ChunkReceiver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn pump<C: FrameChannel>(
    mut channel: C,
    cipher: Arc<ChunkCipher>,
    assembly: Arc<ChunkAssembly>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    cancel: CancelToken,
) {
    loop {
        let frame = tokio::select! {
            maybe = channel.recv() => maybe,
            _ = cancel.cancelled() => break,
        };
        let Some(frame) = frame else {
            let _ = events.send(ReceiverEvent::ChannelClosed(channel.id()));
            break;
        };

        let chunk = match EncryptedChunk::decode(&frame) {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = events.send(ReceiverEvent::Protocol(err));
                break;
            }
        };
        if chunk.total != assembly.total() {
            let _ = events.send(ReceiverEvent::Protocol(ProtocolError::TotalMismatch {
                declared: assembly.total(),
                got: chunk.total,
            }));
            break;
        }

        let plaintext = match cipher.decrypt_chunk(&chunk) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                let _ = events.send(ReceiverEvent::Crypto(err));
                break;
            }
        };

        if assembly.bytes_received() + plaintext.len() as u64 > assembly.max_bytes() {
            let _ = events.send(ReceiverEvent::OverCapacity {
                bytes: assembly.bytes_received() + plaintext.len() as u64,
                max: assembly.max_bytes(),
            });
            break;
        }

        let index = chunk.index;
        let len = plaintext.len() as u64;
        match assembly.insert(index, Bytes::from(plaintext)) {
            Ok(complete) => {
                let _ = events.send(ReceiverEvent::Chunk { index, bytes: len });
                if complete {
                    debug!(total = assembly.total(), "all chunks assembled");
                    let _ = events.send(ReceiverEvent::Complete);
                    break;
                }
            }
            Err(err) => {
                let _ = events.send(ReceiverEvent::Protocol(err));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemChannel, MemLink, cancel_pair};
    use crypto_session::{
        Direction, HybridKeyPair, NonceSequence, SessionKeys, encapsulate,
    };
    use rand::seq::SliceRandom;
    use std::time::Duration;

    const TEST_MAX_BYTES: u64 = 64 * 1024 * 1024;

    fn test_cipher() -> ChunkCipher {
        let keypair = HybridKeyPair::generate();
        let (_, secret) =
            encapsulate(keypair.kem_public_bytes(), &keypair.ec_public_bytes()).unwrap();
        let keys = SessionKeys::derive(&secret).unwrap();
        ChunkCipher::new(&keys).unwrap()
    }

    fn encrypt_all(cipher: &ChunkCipher, file: &[u8], chunk_size: usize) -> Vec<EncryptedChunk> {
        let mut nonces = NonceSequence::new(Direction::Initiator);
        let total = file.len().div_ceil(chunk_size) as u32;
        file.chunks(chunk_size)
            .enumerate()
            .map(|(index, plain)| {
                let nonce = nonces.next().unwrap();
                cipher
                    .encrypt_chunk(plain, index as u32, total, nonce)
                    .unwrap()
            })
            .collect()
    }

    async fn open_pairs(
        count: usize,
        limits: ChannelLimits,
        auto_drain: bool,
    ) -> (Vec<MemChannel>, Vec<MemChannel>) {
        let (alice, mut bob) = MemLink::pair_with(limits, auto_drain);
        let mut near = Vec::new();
        let mut far = Vec::new();
        for index in 0..count {
            near.push(
                alice
                    .open_channel(ChannelId::data(index as u8))
                    .await
                    .unwrap(),
            );
            far.push(bob.accept_channel().await.unwrap());
        }
        (near, far)
    }

    #[tokio::test]
    async fn round_robin_spreads_chunks_evenly() {
        let cipher = test_cipher();
        let chunks = encrypt_all(&cipher, &vec![7u8; 4 * 1024], 1024);
        let (near, far) = open_pairs(2, ChannelLimits::default(), true).await;
        let (_handle, cancel) = cancel_pair();
        let mut sender = ChunkSender::new(near, ChannelLimits::default(), cancel);

        for chunk in &chunks {
            sender.send_chunk(chunk).await.unwrap();
        }
        assert_eq!(sender.chunks_sent(), 4);

        for mut channel in far {
            let mut seen = 0;
            while tokio::time::timeout(Duration::from_millis(50), channel.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {
                seen += 1;
            }
            assert_eq!(seen, 2);
        }
    }

    #[tokio::test]
    async fn reassembles_shuffled_delivery_across_channels() {
        let cipher = Arc::new(test_cipher());
        let file: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        let mut chunks = encrypt_all(&cipher, &file, 16 * 1024);
        let total = chunks.len() as u32;
        chunks.shuffle(&mut rand::thread_rng());

        let (near, far) = open_pairs(3, ChannelLimits::default(), true).await;
        let (_handle, cancel) = cancel_pair();
        let mut receiver = ChunkReceiver::start(far, cipher, total, TEST_MAX_BYTES, cancel);

        for (i, chunk) in chunks.iter().enumerate() {
            near[i % near.len()].send(chunk.encode()).await.unwrap();
        }

        loop {
            match receiver.next_event().await.unwrap() {
                ReceiverEvent::Complete => break,
                ReceiverEvent::Chunk { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(receiver.assembly().assemble().unwrap(), file);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_rejected() {
        let cipher = Arc::new(test_cipher());
        let chunks = encrypt_all(&cipher, &[5u8; 2048], 1024);
        let (near, far) = open_pairs(1, ChannelLimits::default(), true).await;
        let (_handle, cancel) = cancel_pair();
        let mut receiver = ChunkReceiver::start(far, cipher, 2, TEST_MAX_BYTES, cancel);

        near[0].send(chunks[0].encode()).await.unwrap();
        near[0].send(chunks[0].encode()).await.unwrap();

        assert!(matches!(
            receiver.next_event().await.unwrap(),
            ReceiverEvent::Chunk { index: 0, .. }
        ));
        assert!(matches!(
            receiver.next_event().await.unwrap(),
            ReceiverEvent::Protocol(ProtocolError::DuplicateChunk(0))
        ));
    }

    #[tokio::test]
    async fn tampered_frame_surfaces_as_crypto_error() {
        let cipher = Arc::new(test_cipher());
        let chunks = encrypt_all(&cipher, &[9u8; 1024], 1024);
        let (near, far) = open_pairs(1, ChannelLimits::default(), true).await;
        let (_handle, cancel) = cancel_pair();
        let mut receiver = ChunkReceiver::start(far, cipher, 1, TEST_MAX_BYTES, cancel);

        let mut frame = chunks[0].encode().to_vec();
        let mid = frame.len() / 2;
        frame[mid] ^= 0x01;
        near[0].send(Bytes::from(frame)).await.unwrap();

        assert!(matches!(
            receiver.next_event().await.unwrap(),
            ReceiverEvent::Crypto(CryptoError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn sender_parks_at_high_watermark_until_drain() {
        let cipher = test_cipher();
        let chunks = encrypt_all(&cipher, &vec![3u8; 3 * 1024], 1024);
        let frame_len = chunks[0].encoded_len();
        let limits = ChannelLimits {
            high_watermark: 2 * frame_len,
            low_watermark: frame_len,
        };
        let (near, _far) = open_pairs(1, limits, false).await;
        let drain = near[0].drain_control();
        let (_handle, cancel) = cancel_pair();
        let mut sender = ChunkSender::new(near, limits, cancel);

        sender.send_chunk(&chunks[0]).await.unwrap();
        sender.send_chunk(&chunks[1]).await.unwrap();
        assert_eq!(sender.buffered_total(), 2 * frame_len);

        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
        let third = chunks[2].clone();
        let blocked = tokio::spawn(async move {
            let result = sender.send_chunk(&third).await;
            let _ = done_tx.send(());
            result
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(done_rx.try_recv().is_err(), "send should still be parked");

        // One frame forwarded leaves the gauge exactly at the low
        // watermark, which is not yet below it.
        drain.grant(frame_len);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(done_rx.try_recv().is_err(), "hysteresis should hold");

        drain.grant(frame_len);
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_channel_leaves_rotation() {
        let cipher = test_cipher();
        let chunks = encrypt_all(&cipher, &vec![1u8; 4 * 1024], 1024);
        let (mut near, far) = open_pairs(2, ChannelLimits::default(), true).await;
        near[1].fail();
        let (_handle, cancel) = cancel_pair();
        let mut sender = ChunkSender::new(near, ChannelLimits::default(), cancel);

        for chunk in &chunks {
            sender.send_chunk(chunk).await.unwrap();
        }
        assert_eq!(sender.active_channels(), 1);

        let mut survivors = far;
        let mut seen = 0;
        while tokio::time::timeout(Duration::from_millis(50), survivors[0].recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn no_channels_left_is_an_error() {
        let cipher = test_cipher();
        let chunks = encrypt_all(&cipher, &[1u8; 1024], 1024);
        let (mut near, _far) = open_pairs(2, ChannelLimits::default(), true).await;
        near[0].fail();
        near[1].fail();
        let (_handle, cancel) = cancel_pair();
        let mut sender = ChunkSender::new(near, ChannelLimits::default(), cancel);

        assert!(matches!(
            sender.send_chunk(&chunks[0]).await,
            Err(TransportError::AllChannelsFailed)
        ));
    }

    #[tokio::test]
    async fn cancel_unblocks_a_parked_sender() {
        let cipher = test_cipher();
        let chunks = encrypt_all(&cipher, &vec![2u8; 2 * 1024], 1024);
        let frame_len = chunks[0].encoded_len();
        let limits = ChannelLimits {
            high_watermark: frame_len,
            low_watermark: frame_len / 2,
        };
        let (near, _far) = open_pairs(1, limits, false).await;
        let (handle, cancel) = cancel_pair();
        let mut sender = ChunkSender::new(near, limits, cancel);

        sender.send_chunk(&chunks[0]).await.unwrap();
        let second = chunks[1].clone();
        let blocked = tokio::spawn(async move { sender.send_chunk(&second).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert!(matches!(
            blocked.await.unwrap(),
            Err(TransportError::Cancelled)
        ));
    }
}
