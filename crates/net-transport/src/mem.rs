//! In-process channel backend
//!
//! Wires two endpoints through unbounded queues. Draining is either
//! automatic (frames forward immediately) or manual, where a test grants
//! byte budget to let queued frames through; that is how watermark
//! behavior is exercised without a network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc};
use tracing::debug;
use wire_protocol::{ChannelId, MAX_FRAME_SIZE};

use crate::{
    CancelHandle, CancelToken, ChannelLimits, FrameChannel, QueueWorker, SendQueue,
    TransportError, TransportResult, cancel_pair, send_queue,
};

/// Controls when a memory channel's writer forwards queued frames
#[derive(Clone)]
pub struct DrainControl {
    auto: bool,
    budget: Arc<Semaphore>,
}

impl DrainControl {
    fn automatic() -> Self {
        Self {
            auto: true,
            budget: Arc::new(Semaphore::new(0)),
        }
    }

    fn manual() -> Self {
        Self {
            auto: false,
            budget: Arc::new(Semaphore::new(0)),
        }
    }

    /// Allow `bytes` more queued bytes to forward (manual mode)
    pub fn grant(&self, bytes: usize) {
        if !self.auto {
            self.budget.add_permits(bytes);
        }
    }

    async fn wait_budget(&self, bytes: usize, close: &CancelToken) -> Result<(), ()> {
        if self.auto {
            return Ok(());
        }
        tokio::select! {
            permit = self.budget.acquire_many(bytes as u32) => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(()),
            },
            _ = close.cancelled() => Err(()),
        }
    }
}

/// One side of an in-process peer connection
pub struct MemLink {
    open_tx: mpsc::UnboundedSender<MemChannel>,
    pending: mpsc::UnboundedReceiver<MemChannel>,
    limits: ChannelLimits,
    drain: DrainControl,
    peer_drain: DrainControl,
    closed: Arc<AtomicBool>,
}

impl MemLink {
    /// Connected pair with automatic draining
    pub fn pair() -> (MemLink, MemLink) {
        Self::pair_with(ChannelLimits::default(), true)
    }

    /// Connected pair with explicit limits; `auto_drain = false` leaves
    /// forwarding under test control via [`MemLink::drain_control`]. All
    /// channels opened from one half share that half's budget.
    pub fn pair_with(limits: ChannelLimits, auto_drain: bool) -> (MemLink, MemLink) {
        let (a_tx, b_pending) = mpsc::unbounded_channel();
        let (b_tx, a_pending) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let (a_drain, b_drain) = if auto_drain {
            (DrainControl::automatic(), DrainControl::automatic())
        } else {
            (DrainControl::manual(), DrainControl::manual())
        };
        (
            MemLink {
                open_tx: a_tx,
                pending: a_pending,
                limits,
                drain: a_drain.clone(),
                peer_drain: b_drain.clone(),
                closed: closed.clone(),
            },
            MemLink {
                open_tx: b_tx,
                pending: b_pending,
                limits,
                drain: b_drain,
                peer_drain: a_drain,
                closed,
            },
        )
    }

    /// This half's outgoing drain budget, shared by all of its channels.
    /// Keeps metering possible after the link itself moves elsewhere.
    pub fn drain_control(&self) -> DrainControl {
        self.drain.clone()
    }

    /// Open a channel; the matching end appears at the peer's
    /// `accept_channel`
    pub async fn open_channel(&self, id: ChannelId) -> TransportResult<MemChannel> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        let (here_tx, there_rx) = mpsc::unbounded_channel();
        let (there_tx, here_rx) = mpsc::unbounded_channel();

        let local = MemChannel::start(id, here_tx, here_rx, self.limits, self.drain.clone());
        let remote = MemChannel::start(id, there_tx, there_rx, self.limits, self.peer_drain.clone());

        self.open_tx
            .send(remote)
            .map_err(|_| TransportError::ConnectionClosed("peer link dropped".to_string()))?;
        debug!(channel = %id, "memory channel opened");
        Ok(local)
    }

    /// Accept the next channel the peer opened
    pub async fn accept_channel(&mut self) -> TransportResult<MemChannel> {
        self.pending
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionClosed("peer link dropped".to_string()))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One in-process channel endpoint
pub struct MemChannel {
    id: ChannelId,
    queue: SendQueue,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    close_handle: CancelHandle,
    drain: DrainControl,
}

impl MemChannel {
    fn start(
        id: ChannelId,
        peer_tx: mpsc::UnboundedSender<Bytes>,
        incoming: mpsc::UnboundedReceiver<Bytes>,
        limits: ChannelLimits,
        drain: DrainControl,
    ) -> Self {
        let (queue, worker) = send_queue(limits.low_watermark);
        let (close_handle, close_token) = cancel_pair();

        tokio::spawn(mem_write_loop(worker, peer_tx, drain.clone(), close_token));

        Self {
            id,
            queue,
            incoming,
            close_handle,
            drain,
        }
    }

    /// Outgoing drain budget; shared with the other channels of the
    /// link half this endpoint came from
    pub fn drain_control(&self) -> DrainControl {
        self.drain.clone()
    }

    /// Abrupt failure: no flush, peer sees the channel vanish
    pub fn fail(&mut self) {
        self.queue.mark_closed();
        self.close_handle.cancel();
    }

    pub fn bytes_sent(&self) -> u64 {
        self.queue.bytes_sent()
    }
}

impl FrameChannel for MemChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.queue.push(frame, self.id)
    }

    fn buffered_amount(&self) -> usize {
        self.queue.buffered()
    }

    async fn drained(&self) {
        self.queue.drained().await
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    fn is_open(&self) -> bool {
        self.queue.is_open()
    }

    async fn close(&mut self) {
        self.queue.mark_closed();
        self.close_handle.cancel();
    }
}

impl Drop for MemChannel {
    fn drop(&mut self) {
        self.queue.mark_closed();
        self.close_handle.cancel();
    }
}

async fn mem_write_loop(
    mut worker: QueueWorker,
    peer_tx: mpsc::UnboundedSender<Bytes>,
    drain: DrainControl,
    close: CancelToken,
) {
    loop {
        let frame = tokio::select! {
            maybe = worker.next() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = close.cancelled() => break,
        };
        if drain.wait_budget(frame.len(), &close).await.is_err() {
            break;
        }
        if peer_tx.send(frame.clone()).is_err() {
            break;
        }
        worker.complete(frame.len());
    }

    // Flush what was queued before a graceful close; manual-drain frames
    // without budget are dropped with the channel.
    if drain.auto {
        while let Some(frame) = worker.next_ready() {
            if peer_tx.send(frame.clone()).is_err() {
                break;
            }
            worker.complete(frame.len());
        }
    }
    worker.mark_closed();
}
