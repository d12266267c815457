//! Client circuits and relayed channels
//!
//! `CircuitManager` telescopes a route out of the directory, blaming and
//! excluding a failed hop before retrying with fresh relays. A built
//! circuit multiplexes logical streams over one cell link, and each
//! stream presents the same channel surface as a direct QUIC channel, so
//! the transfer layer cannot tell which path it is on.
//!
//! Stream ids follow the channel convention: 0 is control, data channels
//! count up from 1. The circuit-building side opens streams; the target
//! side accepts them.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crypto_session::encapsulate;
use dashmap::DashMap;
use net_transport::{ChannelLimits, FrameChannel, TransportError, TransportResult};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use wire_protocol::{ChannelId, MAX_FRAME_SIZE};

use crate::{
    CIRCUIT_HOPS, CellLink, Fragmenter, LayerKey, Reassembler, RelayCell, RelayCommand,
    RelayDialer, RelayDirectory, RelayError, RelayNodeInfo, RelayReply, RelayResult, StreamFrame,
    derive_layer_key, pick_route, pump_link, unwrap_reply, wrap_for_hop,
};

/// Circuit manager configuration
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Relays per circuit
    pub hops: usize,
    /// Budget for one build attempt, route selection to target connect
    pub build_timeout: Duration,
    /// Age after which a circuit should be replaced
    pub rotation_interval: Duration,
    /// Build attempts before giving up
    pub max_build_attempts: usize,
    /// Watermarks for relayed channels
    pub limits: ChannelLimits,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            hops: CIRCUIT_HOPS,
            build_timeout: Duration::from_secs(15),
            rotation_interval: Duration::from_secs(600),
            max_build_attempts: 3,
            limits: ChannelLimits::default(),
        }
    }
}

/// Shared backlog gauge for everything queued on one circuit link
struct LinkGauge {
    buffered: AtomicUsize,
    bytes_sent: AtomicU64,
    drain: Notify,
    open: AtomicBool,
    low_watermark: usize,
}

impl LinkGauge {
    fn new(low_watermark: usize) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            drain: Notify::new(),
            open: AtomicBool::new(true),
            low_watermark,
        }
    }

    fn add(&self, len: usize) {
        self.buffered.fetch_add(len, Ordering::AcqRel);
    }

    fn complete(&self, len: usize) {
        let previous = self.buffered.fetch_sub(len, Ordering::AcqRel);
        self.bytes_sent.fetch_add(len as u64, Ordering::AcqRel);
        let now = previous.saturating_sub(len);
        if previous >= self.low_watermark && now < self.low_watermark {
            self.drain.notify_waiters();
        }
    }

    fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.drain.notify_waiters();
    }

    async fn drained(&self) {
        loop {
            let notified = self.drain.notified();
            if !self.is_open() || self.buffered() < self.low_watermark {
                return;
            }
            notified.await;
        }
    }
}

/// Logical stream over a circuit, speaking the common channel surface
pub struct RelayChannel {
    id: ChannelId,
    out_tx: mpsc::UnboundedSender<StreamFrame>,
    fragmenter: Arc<Mutex<Fragmenter>>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    streams: Arc<DashMap<u16, mpsc::UnboundedSender<Bytes>>>,
    gauge: Arc<LinkGauge>,
    open: bool,
}

impl FrameChannel for RelayChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed(self.id));
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        // Gauge first: the glue completes frames as it wraps them, and
        // must never observe a completion before the matching add.
        self.gauge.add(frame.len());
        let fragments = self.fragmenter.lock().split(self.id.0 as u16, &frame);
        for fragment in fragments {
            if self.out_tx.send(fragment).is_err() {
                return Err(TransportError::ChannelClosed(self.id));
            }
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        // All streams share the circuit link, so they share its backlog.
        self.gauge.buffered()
    }

    async fn drained(&self) {
        self.gauge.drained().await
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    fn is_open(&self) -> bool {
        self.open && self.gauge.is_open()
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let fin = self.fragmenter.lock().fin(self.id.0 as u16);
        let _ = self.out_tx.send(fin);
        self.streams.remove(&(self.id.0 as u16));
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.streams.remove(&(self.id.0 as u16));
    }
}

/// Demultiplexes stream frames arriving on one link
pub struct StreamMux {
    out_tx: mpsc::UnboundedSender<StreamFrame>,
    streams: Arc<DashMap<u16, mpsc::UnboundedSender<Bytes>>>,
    accept_rx: mpsc::UnboundedReceiver<RelayChannel>,
    fragmenter: Arc<Mutex<Fragmenter>>,
    gauge: Arc<LinkGauge>,
}

/// Wire a mux to a link glue: returns the mux, the stream frames the
/// glue must carry out, and the sender the glue feeds inbound frames to
fn stream_mux(
    limits: ChannelLimits,
) -> (
    StreamMux,
    mpsc::UnboundedReceiver<StreamFrame>,
    mpsc::UnboundedSender<StreamFrame>,
    Arc<LinkGauge>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<StreamFrame>();
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let streams: Arc<DashMap<u16, mpsc::UnboundedSender<Bytes>>> = Arc::new(DashMap::new());
    let fragmenter = Arc::new(Mutex::new(Fragmenter::default()));
    let gauge = Arc::new(LinkGauge::new(limits.low_watermark));

    let demux_streams = streams.clone();
    let demux_out = out_tx.clone();
    let demux_fragmenter = fragmenter.clone();
    let demux_gauge = gauge.clone();
    tokio::spawn(async move {
        let mut reassembler = Reassembler::default();
        while let Some(frame) = in_rx.recv().await {
            let message = match reassembler.push(frame) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "stream reassembly failed");
                    break;
                }
            };
            if message.fin {
                demux_streams.remove(&message.stream);
                continue;
            }
            let tx = demux_streams
                .entry(message.stream)
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let channel = RelayChannel {
                        id: ChannelId(message.stream as u8),
                        out_tx: demux_out.clone(),
                        fragmenter: demux_fragmenter.clone(),
                        incoming: rx,
                        streams: demux_streams.clone(),
                        gauge: demux_gauge.clone(),
                        open: true,
                    };
                    let _ = accept_tx.send(channel);
                    tx
                })
                .clone();
            if tx.send(Bytes::from(message.data)).is_err() {
                demux_streams.remove(&message.stream);
            }
        }
        // Link gone: every stream sees end-of-stream.
        demux_streams.clear();
        demux_gauge.close();
    });

    let glue_gauge = gauge.clone();
    (
        StreamMux {
            out_tx,
            streams,
            accept_rx,
            fragmenter,
            gauge,
        },
        out_rx,
        in_tx,
        glue_gauge,
    )
}

impl StreamMux {
    /// Open a stream by id; the far side sees it on its accept queue
    fn open(&self, id: ChannelId) -> RelayChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(id.0 as u16, tx);
        RelayChannel {
            id,
            out_tx: self.out_tx.clone(),
            fragmenter: self.fragmenter.clone(),
            incoming: rx,
            streams: self.streams.clone(),
            gauge: self.gauge.clone(),
            open: true,
        }
    }

    async fn accept(&mut self) -> Option<RelayChannel> {
        self.accept_rx.recv().await
    }
}

/// Builds circuits and hands out relayed connections
pub struct CircuitManager<D: RelayDialer> {
    directory: Arc<dyn RelayDirectory>,
    dialer: D,
    config: CircuitConfig,
}

struct BuildFailure {
    blamed: Option<String>,
    fatal: bool,
    error: RelayError,
}

impl BuildFailure {
    fn hop(relay: &RelayNodeInfo, error: RelayError) -> Self {
        Self {
            blamed: Some(relay.id.clone()),
            fatal: false,
            error,
        }
    }
}

impl<D: RelayDialer> CircuitManager<D> {
    pub fn new(directory: Arc<dyn RelayDirectory>, dialer: D, config: CircuitConfig) -> Self {
        Self {
            directory,
            dialer,
            config,
        }
    }

    /// Build a circuit whose exit connects to `target`.
    ///
    /// A failed hop is excluded from every following attempt; a target
    /// that refuses is terminal, since no route fixes that.
    pub async fn connect(&self, target: &str) -> RelayResult<RelayConnection> {
        let mut exclude: HashSet<String> = HashSet::new();
        let mut last_error = None;

        for attempt in 1..=self.config.max_build_attempts {
            let route = pick_route(self.directory.as_ref(), self.config.hops, &exclude)?;
            let ids: Vec<String> = route.iter().map(|r| r.id.clone()).collect();
            debug!(attempt, route = ?ids, "building relay circuit");

            match tokio::time::timeout(self.config.build_timeout, self.build(&route, target)).await
            {
                Ok(Ok(connection)) => {
                    info!(attempt, route = ?ids, "relay circuit established");
                    return Ok(connection);
                }
                Ok(Err(failure)) => {
                    if failure.fatal {
                        return Err(failure.error);
                    }
                    if let Some(blamed) = failure.blamed {
                        warn!(attempt, relay = %blamed, error = %failure.error, "hop failed, excluding");
                        exclude.insert(blamed);
                    }
                    last_error = Some(failure.error.to_string());
                }
                Err(_) => {
                    // No way to tell which hop stalled; retire the route.
                    warn!(attempt, route = ?ids, "circuit build timed out");
                    exclude.extend(ids);
                    last_error = Some("build timed out".to_string());
                }
            }
        }

        Err(RelayError::CircuitBuild {
            attempts: self.config.max_build_attempts,
            reason: last_error.unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    async fn build(
        &self,
        route: &[RelayNodeInfo],
        target: &str,
    ) -> Result<RelayConnection, BuildFailure> {
        let circuit: u64 = rand::random();
        let entry = &route[0];

        let link = self
            .dialer
            .dial(&entry.address)
            .await
            .map_err(|e| BuildFailure::hop(entry, e))?;
        let (link_tx, mut link_rx) = pump_link(link);

        let mut keys: Vec<LayerKey> = Vec::with_capacity(route.len());

        // Entry hop: plain create on the fresh link.
        let (entry_key, entry_handshake) =
            hop_handshake(entry, 0).map_err(|e| BuildFailure::hop(entry, e))?;
        link_tx
            .send(RelayCell::Create {
                circuit,
                hop: 0,
                handshake: entry_handshake,
            })
            .map_err(|_| BuildFailure::hop(entry, RelayError::LinkClosed))?;
        match link_rx.recv().await {
            Some(RelayCell::Created { .. }) => {}
            Some(RelayCell::CreateFailed { reason, .. }) => {
                return Err(BuildFailure::hop(entry, RelayError::HopRefused(reason)));
            }
            _ => return Err(BuildFailure::hop(entry, RelayError::LinkClosed)),
        }
        keys.push(entry_key);

        // Remaining hops: extend through the partial circuit.
        for (hop, relay) in route.iter().enumerate().skip(1) {
            let (key, handshake) =
                hop_handshake(relay, hop as u8).map_err(|e| BuildFailure::hop(relay, e))?;
            let command = RelayCommand::Extend {
                address: relay.address.clone(),
                hop: hop as u8,
                handshake,
            };
            let payload = wrap_for_hop(&keys, hop - 1, &command)
                .map_err(|e| BuildFailure::hop(relay, e))?;
            link_tx
                .send(RelayCell::Forward { circuit, payload })
                .map_err(|_| BuildFailure::hop(relay, RelayError::LinkClosed))?;

            let reply = next_backward(&mut link_rx, circuit)
                .await
                .and_then(|payload| unwrap_reply(&keys, hop, &payload))
                .map_err(|e| BuildFailure::hop(relay, e))?;
            match reply {
                RelayReply::Extended => keys.push(key),
                RelayReply::ExtendFailed(reason) => {
                    return Err(BuildFailure::hop(relay, RelayError::HopRefused(reason)));
                }
                _ => {
                    return Err(BuildFailure::hop(
                        relay,
                        RelayError::Connection("unexpected reply to extend".to_string()),
                    ));
                }
            }
        }

        // Ask the exit to reach the target.
        let depth = keys.len();
        let exit = depth - 1;
        let connect = RelayCommand::Connect {
            address: target.to_string(),
        };
        let payload = wrap_for_hop(&keys, exit, &connect).map_err(|e| BuildFailure {
            blamed: None,
            fatal: false,
            error: e,
        })?;
        link_tx
            .send(RelayCell::Forward { circuit, payload })
            .map_err(|_| BuildFailure {
                blamed: None,
                fatal: false,
                error: RelayError::LinkClosed,
            })?;
        let reply = next_backward(&mut link_rx, circuit)
            .await
            .and_then(|payload| unwrap_reply(&keys, depth, &payload))
            .map_err(|error| BuildFailure {
                blamed: Some(route[exit].id.clone()),
                fatal: false,
                error,
            })?;
        match reply {
            RelayReply::Connected => {}
            RelayReply::ConnectFailed(reason) => {
                return Err(BuildFailure {
                    blamed: None,
                    fatal: true,
                    error: RelayError::Connection(reason),
                });
            }
            _ => {
                return Err(BuildFailure {
                    blamed: None,
                    fatal: false,
                    error: RelayError::Connection("unexpected reply to connect".to_string()),
                });
            }
        }

        // Steady state: spawn the glue and hand the mux out.
        let keys = Arc::new(keys);
        let (mux, mut out_rx, in_tx, gauge) = stream_mux(self.config.limits);

        let inbound_keys = keys.clone();
        tokio::spawn(async move {
            while let Some(cell) = link_rx.recv().await {
                let RelayCell::Backward {
                    circuit: c,
                    payload,
                } = cell
                else {
                    continue;
                };
                if c != circuit {
                    continue;
                }
                match unwrap_reply(&inbound_keys, depth, &payload) {
                    Ok(RelayReply::Data(bytes)) => {
                        match bincode::deserialize::<StreamFrame>(&bytes) {
                            Ok(frame) => {
                                if in_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed stream frame from circuit");
                                break;
                            }
                        }
                    }
                    Ok(RelayReply::TargetClosed) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "backward cell failed to unwrap");
                        break;
                    }
                }
            }
        });

        let outbound_keys = keys.clone();
        let outbound_link = link_tx.clone();
        let outbound_gauge = gauge.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let len = frame.payload.len();
                let Ok(bytes) = bincode::serialize(&frame) else {
                    break;
                };
                let Ok(payload) =
                    wrap_for_hop(&outbound_keys, exit, &RelayCommand::Deliver(bytes))
                else {
                    break;
                };
                if outbound_link
                    .send(RelayCell::Forward { circuit, payload })
                    .is_err()
                {
                    break;
                }
                outbound_gauge.complete(len);
            }
            outbound_gauge.close();
        });

        Ok(RelayConnection {
            circuit,
            link_tx,
            mux,
            route: route.iter().map(|r| r.id.clone()).collect(),
            built_at: Instant::now(),
            rotation_interval: self.config.rotation_interval,
        })
    }
}

fn hop_handshake(relay: &RelayNodeInfo, hop: u8) -> RelayResult<(LayerKey, Vec<u8>)> {
    let (ciphertext, secret) = encapsulate(&relay.kem_public, &relay.ec_public)?;
    Ok((derive_layer_key(&secret, hop), ciphertext.to_bytes()))
}

async fn next_backward(
    link_rx: &mut mpsc::UnboundedReceiver<RelayCell>,
    circuit: u64,
) -> RelayResult<Vec<u8>> {
    while let Some(cell) = link_rx.recv().await {
        match cell {
            RelayCell::Backward {
                circuit: c,
                payload,
            } if c == circuit => return Ok(payload),
            RelayCell::Teardown { circuit: c } if c == circuit => {
                return Err(RelayError::LinkClosed);
            }
            _ => continue,
        }
    }
    Err(RelayError::LinkClosed)
}

/// Live circuit from the building side
pub struct RelayConnection {
    circuit: u64,
    link_tx: mpsc::UnboundedSender<RelayCell>,
    mux: StreamMux,
    route: Vec<String>,
    built_at: Instant,
    rotation_interval: Duration,
}

impl RelayConnection {
    pub fn open_channel(&self, id: ChannelId) -> RelayChannel {
        self.mux.open(id)
    }

    pub async fn accept_channel(&mut self) -> Option<RelayChannel> {
        self.mux.accept().await
    }

    /// Relay ids along the route, entry first
    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }

    /// True once the circuit has outlived its rotation interval
    pub fn needs_rotation(&self) -> bool {
        self.age() >= self.rotation_interval
    }

    pub fn close(&self) {
        let _ = self.link_tx.send(RelayCell::Teardown {
            circuit: self.circuit,
        });
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accepting end of a circuit: the transfer target behind the exit
pub struct TargetSession {
    mux: StreamMux,
}

impl TargetSession {
    /// Wrap a link the exit relay dialed to us
    pub fn accept<L: CellLink>(link: L, limits: ChannelLimits) -> Self {
        let (link_tx, mut link_rx) = pump_link(link);
        let (mux, mut out_rx, in_tx, gauge) = stream_mux(limits);

        tokio::spawn(async move {
            while let Some(cell) = link_rx.recv().await {
                let RelayCell::Data { payload } = cell else {
                    continue;
                };
                match bincode::deserialize::<StreamFrame>(&payload) {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed stream frame from exit");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let len = frame.payload.len();
                let Ok(payload) = bincode::serialize(&frame) else {
                    break;
                };
                if link_tx.send(RelayCell::Data { payload }).is_err() {
                    break;
                }
                gauge.complete(len);
            }
            gauge.close();
        });

        Self { mux }
    }

    pub async fn accept_channel(&mut self) -> Option<RelayChannel> {
        self.mux.accept().await
    }

    pub fn open_channel(&self, id: ChannelId) -> RelayChannel {
        self.mux.open(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemFabric, RelayNode, StaticDirectory};

    struct Fixture {
        fabric: MemFabric,
        directory: Arc<StaticDirectory>,
    }

    /// `live` relays serve the fabric; `dead` descriptors point nowhere
    fn fixture(live: usize, dead: usize) -> Fixture {
        let fabric = MemFabric::new();
        let mut descriptors = Vec::new();
        for i in 0..live {
            let id = format!("relay-{i}");
            let address = format!("mem://{id}");
            let node = Arc::new(RelayNode::new(&id, &address, fabric.clone()));
            descriptors.push(node.descriptor());
            node.serve(fabric.listen(&address));
        }
        for i in 0..dead {
            descriptors.push(RelayNodeInfo {
                id: format!("dead-{i}"),
                address: format!("mem://dead-{i}"),
                kem_public: vec![0u8; 1184],
                ec_public: [0u8; 32],
                region: None,
            });
        }
        Fixture {
            fabric,
            directory: Arc::new(StaticDirectory::new(descriptors)),
        }
    }

    #[tokio::test]
    async fn three_hop_circuit_carries_frames_both_ways() {
        let Fixture { fabric, directory } = fixture(3, 0);
        let mut target_incoming = fabric.listen("mem://peer-b");

        let target = tokio::spawn(async move {
            let link = target_incoming.recv().await.unwrap();
            let mut session = TargetSession::accept(link, ChannelLimits::default());
            let mut channel = session.accept_channel().await.unwrap();
            let frame = channel.recv().await.unwrap();
            channel.send(Bytes::from_static(b"ack")).await.unwrap();
            (frame, session, channel)
        });

        let manager = CircuitManager::new(directory, fabric.clone(), CircuitConfig::default());
        let connection = manager.connect("mem://peer-b").await.unwrap();
        assert_eq!(connection.route().len(), 3);

        let mut channel = connection.open_channel(ChannelId::CONTROL);
        channel
            .send(Bytes::from_static(b"hello through the onion"))
            .await
            .unwrap();
        assert_eq!(channel.recv().await.unwrap(), Bytes::from_static(b"ack"));

        let (frame, _session, _target_channel) = target.await.unwrap();
        assert_eq!(frame, Bytes::from_static(b"hello through the onion"));
    }

    #[tokio::test]
    async fn large_frames_fragment_across_cells() {
        let Fixture { fabric, directory } = fixture(3, 0);
        let mut target_incoming = fabric.listen("mem://peer-b");

        let target = tokio::spawn(async move {
            let link = target_incoming.recv().await.unwrap();
            let mut session = TargetSession::accept(link, ChannelLimits::default());
            let mut channel = session.accept_channel().await.unwrap();
            let frame = channel.recv().await.unwrap();
            (frame, session, channel)
        });

        let manager = CircuitManager::new(directory, fabric.clone(), CircuitConfig::default());
        let connection = manager.connect("mem://peer-b").await.unwrap();

        let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 239) as u8).collect();
        let channel = connection.open_channel(ChannelId::data(0));
        channel.send(Bytes::from(payload.clone())).await.unwrap();

        let (frame, _session, _target_channel) = target.await.unwrap();
        assert_eq!(frame.len(), payload.len());
        assert_eq!(frame, Bytes::from(payload));
    }

    #[tokio::test]
    async fn failed_hop_is_excluded_on_rebuild() {
        let Fixture { fabric, directory } = fixture(3, 1);
        let _target_incoming = fabric.listen("mem://peer-b");

        let manager = CircuitManager::new(directory, fabric.clone(), CircuitConfig::default());
        let connection = manager.connect("mem://peer-b").await.unwrap();

        assert_eq!(connection.route().len(), 3);
        assert!(connection.route().iter().all(|id| !id.starts_with("dead")));
    }

    #[tokio::test]
    async fn circuits_age_toward_rotation() {
        let Fixture { fabric, directory } = fixture(3, 0);
        let _target_incoming = fabric.listen("mem://peer-b");

        let config = CircuitConfig {
            rotation_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = CircuitManager::new(directory, fabric.clone(), config);
        let connection = manager.connect("mem://peer-b").await.unwrap();

        assert!(!connection.needs_rotation());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(connection.needs_rotation());
    }

    #[tokio::test]
    async fn teardown_reaches_the_target() {
        let Fixture { fabric, directory } = fixture(3, 0);
        let mut target_incoming = fabric.listen("mem://peer-b");

        let target = tokio::spawn(async move {
            let link = target_incoming.recv().await.unwrap();
            let mut session = TargetSession::accept(link, ChannelLimits::default());
            let mut channel = session.accept_channel().await.unwrap();
            let first = channel.recv().await.unwrap();
            let second = channel.recv().await;
            (first, second, session)
        });

        let manager = CircuitManager::new(directory, fabric.clone(), CircuitConfig::default());
        let connection = manager.connect("mem://peer-b").await.unwrap();

        let channel = connection.open_channel(ChannelId::CONTROL);
        channel.send(Bytes::from_static(b"only one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.close();

        let (first, second, _session) =
            tokio::time::timeout(Duration::from_secs(2), target)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(first, Bytes::from_static(b"only one"));
        assert!(second.is_none());
    }
}
