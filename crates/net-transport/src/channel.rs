//! Frame channel abstraction and shared send-queue plumbing

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use wire_protocol::ChannelId;

use crate::{HIGH_WATERMARK, LOW_WATERMARK, TransportError, TransportResult};

/// Watermarks governing when a channel pauses and resumes
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Buffered bytes at which the channel is paused
    pub high_watermark: usize,
    /// Buffered bytes below which the channel resumes
    pub low_watermark: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
        }
    }
}

/// One transport sub-path carrying length-prefixed frames.
///
/// Channels over one connection are mutually unordered; ordering across
/// them is supplied by the chunk indices riding the frames. All futures
/// are `Send` so callers can drive channels from spawned tasks.
pub trait FrameChannel {
    fn id(&self) -> ChannelId;

    /// Queue a frame for delivery. Never blocks on the network; the
    /// buffered-amount gauge is how callers see pressure.
    fn send(&self, frame: Bytes) -> impl Future<Output = TransportResult<()>> + Send;

    /// Bytes queued but not yet handed to the transport
    fn buffered_amount(&self) -> usize;

    /// Resolves when the buffer has drained below the low watermark, or
    /// when the channel closes
    fn drained(&self) -> impl Future<Output = ()> + Send;

    /// Next frame from the peer; `None` once the channel is closed
    fn recv(&mut self) -> impl Future<Output = Option<Bytes>> + Send;

    fn is_open(&self) -> bool;

    /// Close gracefully; queued frames may still flush
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub(crate) struct QueueShared {
    buffered: AtomicUsize,
    bytes_sent: AtomicU64,
    drain: Notify,
    open: AtomicBool,
    low_watermark: usize,
}

/// Sender half of a channel's outgoing queue: tracks the buffered gauge
/// and wakes drain waiters when the writer crosses the low watermark.
pub(crate) struct SendQueue {
    shared: Arc<QueueShared>,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Consumed by the channel's writer task
pub(crate) struct QueueWorker {
    rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<QueueShared>,
}

pub(crate) fn send_queue(low_watermark: usize) -> (SendQueue, QueueWorker) {
    let shared = Arc::new(QueueShared {
        buffered: AtomicUsize::new(0),
        bytes_sent: AtomicU64::new(0),
        drain: Notify::new(),
        open: AtomicBool::new(true),
        low_watermark,
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SendQueue {
            shared: shared.clone(),
            tx,
        },
        QueueWorker { rx, shared },
    )
}

impl SendQueue {
    pub fn push(&self, frame: Bytes, channel: ChannelId) -> TransportResult<()> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(channel));
        }
        self.shared
            .buffered
            .fetch_add(frame.len(), Ordering::AcqRel);
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed(channel))
    }

    pub fn buffered(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Mark the channel closed and release every drain waiter
    pub fn mark_closed(&self) {
        self.shared.open.store(false, Ordering::Release);
        self.shared.drain.notify_waiters();
    }

    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drain.notified();
            if !self.is_open() || self.buffered() < self.shared.low_watermark {
                return;
            }
            notified.await;
        }
    }
}

impl Clone for SendQueue {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl QueueWorker {
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Already-queued frame, without waiting; used to flush on close
    pub fn next_ready(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Account for a frame handed to the transport and wake drain
    /// waiters on a low-watermark crossing
    pub fn complete(&self, len: usize) {
        let before = self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
        self.shared.bytes_sent.fetch_add(len as u64, Ordering::AcqRel);
        let after = before.saturating_sub(len);
        if before >= self.shared.low_watermark && after < self.shared.low_watermark {
            self.shared.drain.notify_waiters();
        }
    }

    pub fn mark_closed(&self) {
        self.shared.open.store(false, Ordering::Release);
        self.shared.drain.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gauge_tracks_pushed_and_completed_frames() {
        let (queue, mut worker) = send_queue(8);
        queue.push(Bytes::from(vec![0u8; 16]), ChannelId::data(0)).unwrap();
        assert_eq!(queue.buffered(), 16);

        let frame = worker.next().await.unwrap();
        worker.complete(frame.len());
        assert_eq!(queue.buffered(), 0);
        assert_eq!(queue.bytes_sent(), 16);
    }

    #[tokio::test]
    async fn drained_wakes_on_low_watermark_crossing() {
        let (queue, mut worker) = send_queue(8);
        queue.push(Bytes::from(vec![0u8; 32]), ChannelId::data(0)).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.drained().await })
        };
        // Crossing 32 -> 0 passes below the low watermark of 8.
        let frame = worker.next().await.unwrap();
        worker.complete(frame.len());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn drained_returns_immediately_below_watermark() {
        let (queue, _worker) = send_queue(8);
        queue.drained().await;
    }

    #[tokio::test]
    async fn closed_queue_rejects_frames_and_releases_waiters() {
        let (queue, _worker) = send_queue(8);
        queue.push(Bytes::from(vec![0u8; 64]), ChannelId::data(0)).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.drained().await })
        };
        queue.mark_closed();
        waiter.await.unwrap();

        let err = queue
            .push(Bytes::from_static(b"x"), ChannelId::data(0))
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed(_)));
    }
}
