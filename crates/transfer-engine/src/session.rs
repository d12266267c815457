//! Shared per-transfer session state and control-channel plumbing

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wire_protocol::{ControlMessage, ProtocolError, StateMachine, TransferId, TransferState};

use net_transport::{
    AdaptiveChunkController, AdaptiveConfig, CancelToken, FrameChannel, TransportError,
};

use crate::backend::PeerChannel;
use crate::benchmark::{TransferBenchmark, TransferReport};
use crate::error::{ErrorKind, TransferError, TransferResult};
use crate::events::TransferEvent;

/// What the send side will push: a named blob held in memory
#[derive(Debug, Clone)]
pub struct TransferPayload {
    pub name: String,
    pub mime: Option<String>,
    pub data: Bytes,
}

impl TransferPayload {
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: None,
            data: data.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Read a file from disk. The whole payload is held in memory, so the
    /// receive side's size cap is the practical limit here too.
    pub async fn from_path(path: impl AsRef<Path>) -> TransferResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| TransferError::Resource(format!("reading {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Ok(Self {
            name,
            mime: None,
            data: data.into(),
        })
    }
}

/// State shared between a transfer's driver task and its handle
pub(crate) struct SessionCore {
    pub(crate) id: TransferId,
    state: Mutex<StateMachine>,
    events: mpsc::UnboundedSender<TransferEvent>,
    pub(crate) benchmark: Mutex<TransferBenchmark>,
    pub(crate) controller: AdaptiveChunkController,
    pub(crate) cancel: CancelToken,
}

impl SessionCore {
    pub(crate) fn new(
        id: TransferId,
        adaptive: AdaptiveConfig,
        cancel: CancelToken,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(StateMachine::new()),
            events,
            benchmark: Mutex::new(TransferBenchmark::new()),
            controller: AdaptiveChunkController::new(adaptive),
            cancel,
        })
    }

    pub(crate) fn state(&self) -> TransferState {
        self.state.lock().current()
    }

    /// Advance the state machine, emitting the change
    pub(crate) fn transition(&self, to: TransferState) -> TransferResult<()> {
        let from = self.state.lock().transition(to)?;
        info!(transfer = %self.id, %from, %to, "transfer state changed");
        self.emit(TransferEvent::StateChanged { from, to });
        Ok(())
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    /// Terminal bookkeeping for a failed or cancelled transfer. Several
    /// failures can race on teardown; only the first one lands, the rest
    /// find the machine already terminal and are dropped here.
    pub(crate) fn fail(&self, err: &TransferError) {
        let kind = err.kind();
        let to = if kind == ErrorKind::Cancelled {
            TransferState::Cancelled
        } else {
            TransferState::Failed
        };
        let from = {
            let mut state = self.state.lock();
            if state.current().is_terminal() {
                return;
            }
            let from = state.current();
            let _ = state.transition(to);
            from
        };
        warn!(transfer = %self.id, %from, %to, error = %err, "transfer ended");
        self.emit(TransferEvent::StateChanged { from, to });
        if to == TransferState::Failed {
            self.emit(TransferEvent::Failed {
                kind,
                message: err.to_string(),
            });
        }
    }

    /// Close out the benchmark and hand back the report
    pub(crate) fn finish_report(&self) -> TransferReport {
        self.benchmark.lock().finalize()
    }
}

/// Monotonic clock for ping timestamps. Both ends echo raw microsecond
/// values; only the side that owns the clock interprets them, so the
/// peers never need agreeing clocks.
#[derive(Clone, Copy)]
pub(crate) struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub(crate) fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub(crate) fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    pub(crate) fn rtt_from(&self, echoed_us: u64) -> Duration {
        Duration::from_micros(self.now_us().saturating_sub(echoed_us))
    }
}

/// Control channel with message framing on top of a raw frame channel
pub(crate) struct ControlChannel {
    channel: PeerChannel,
}

impl ControlChannel {
    pub(crate) fn new(channel: PeerChannel) -> Self {
        Self { channel }
    }

    pub(crate) async fn send(&self, message: &ControlMessage) -> TransferResult<()> {
        let encoded = message
            .to_bytes()
            .map_err(ProtocolError::Serialization)?;
        self.channel.send(Bytes::from(encoded)).await?;
        Ok(())
    }

    /// Next message; `None` once the channel closed
    pub(crate) async fn recv(&mut self) -> TransferResult<Option<ControlMessage>> {
        match self.channel.recv().await {
            None => Ok(None),
            Some(frame) => Ok(Some(
                ControlMessage::from_bytes(&frame).map_err(ProtocolError::Serialization)?,
            )),
        }
    }

    /// Wait for the next message, bounded; an early close surfaces as a
    /// connection error rather than a timeout
    pub(crate) async fn recv_timeout(
        &mut self,
        window: Duration,
        waiting_for: &'static str,
    ) -> TransferResult<ControlMessage> {
        match tokio::time::timeout(window, self.recv()).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(TransportError::ConnectionClosed(
                "control channel closed".to_string(),
            )
            .into()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransferError::Timeout(waiting_for)),
        }
    }

    pub(crate) async fn close(&mut self) {
        self.channel.close().await;
    }
}
