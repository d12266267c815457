//! QUIC transport implementation
//!
//! One peer connection carries one bidirectional stream per channel; the
//! first byte on a fresh stream names the channel. Peer authenticity
//! comes from the hybrid handshake above this layer, so the TLS identity
//! is a throwaway self-signed certificate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quinn::{
    ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wire_protocol::{ChannelId, MAX_FRAME_SIZE};

use crate::{
    CancelHandle, CancelToken, ChannelLimits, FrameChannel, QueueWorker, SendQueue,
    TransportError, TransportResult, cancel_pair, send_queue,
};

const SERVER_NAME: &str = "windrop.local";

/// Endpoint wrapper producing peer links
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    /// Create a client-side endpoint
    pub fn client(bind_addr: SocketAddr) -> TransportResult<Self> {
        let client_config = Self::create_client_config()?;

        let mut endpoint = Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint })
    }

    /// Create a server-side endpoint with a self-signed certificate
    pub fn server(bind_addr: SocketAddr) -> TransportResult<Self> {
        let (server_config, _cert) = Self::create_server_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Connect to a remote peer
    pub async fn connect(&self, addr: SocketAddr) -> TransportResult<QuicLink> {
        info!("Connecting to {}", addr);

        let connection = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!("Connected to {}", addr);
        Ok(QuicLink::new(connection))
    }

    /// Accept one incoming connection
    pub async fn accept(&self) -> TransportResult<QuicLink> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| TransportError::ConnectionFailed("Endpoint closed".to_string()))?;

        let connection = incoming
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!("Accepted connection from {}", connection.remote_address());
        Ok(QuicLink::new(connection))
    }

    /// Client TLS config; server identity is not checked at this layer
    fn create_client_config() -> TransportResult<ClientConfig> {
        let crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(Duration::from_secs(30).try_into().unwrap()));
        transport.keep_alive_interval(Some(Duration::from_secs(5)));

        let mut config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        config.transport_config(Arc::new(transport));

        Ok(config)
    }

    /// Server TLS config with a fresh self-signed certificate
    fn create_server_config() -> TransportResult<(ServerConfig, rcgen::CertifiedKey)> {
        let certified_key = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| TransportError::Certificate(e.to_string()))?;

        let cert_der = certified_key.cert.der().clone();
        let key_der = certified_key.key_pair.serialize_der();

        let cert_chain = vec![cert_der];
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(key_der);

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key.into())
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        server_crypto.alpn_protocols = vec![b"windrop".to_vec()];

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(Duration::from_secs(30).try_into().unwrap()));
        transport.keep_alive_interval(Some(Duration::from_secs(5)));

        let mut config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        config.transport_config(Arc::new(transport));

        Ok((config, certified_key))
    }
}

/// One established peer connection
pub struct QuicLink {
    connection: Connection,
    limits: ChannelLimits,
}

impl QuicLink {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            limits: ChannelLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Open a new channel; the id byte travels first on the stream
    pub async fn open_channel(&self, id: ChannelId) -> TransportResult<QuicChannel> {
        let (mut send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        send.write_all(&[id.0])
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        debug!(channel = %id, "channel opened");
        Ok(QuicChannel::start(id, send, recv, self.limits))
    }

    /// Accept the next channel the peer opens
    pub async fn accept_channel(&self) -> TransportResult<QuicChannel> {
        let (send, mut recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        let mut tag = [0u8; 1];
        recv.read_exact(&mut tag)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let id = ChannelId(tag[0]);

        debug!(channel = %id, "channel accepted");
        Ok(QuicChannel::start(id, send, recv, self.limits))
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Connection-level statistics from the QUIC path
    pub fn stats(&self) -> LinkStats {
        let stats = self.connection.stats();
        LinkStats {
            rtt: stats.path.rtt,
            congestion_window: stats.path.cwnd as usize,
            bytes_sent: stats.udp_tx.bytes,
            bytes_received: stats.udp_rx.bytes,
            packets_sent: stats.path.sent_packets,
            packets_lost: stats.path.lost_packets,
        }
    }

    /// Close the connection and every channel on it
    pub fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
        info!("Connection closed: {}", reason);
    }
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct LinkStats {
    pub rtt: Duration,
    pub congestion_window: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
}

/// One channel riding a dedicated bidirectional stream
pub struct QuicChannel {
    id: ChannelId,
    queue: SendQueue,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    close_handle: CancelHandle,
}

impl QuicChannel {
    fn start(id: ChannelId, send: SendStream, recv: RecvStream, limits: ChannelLimits) -> Self {
        let (queue, worker) = send_queue(limits.low_watermark);
        let (close_handle, close_token) = cancel_pair();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(id, send, worker, close_token.clone()));
        tokio::spawn(read_loop(id, recv, incoming_tx, queue.clone()));

        Self {
            id,
            queue,
            incoming: incoming_rx,
            close_handle,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.queue.bytes_sent()
    }
}

impl FrameChannel for QuicChannel {
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

impl Drop for QuicChannel {
    fn drop(&mut self) {
        self.queue.mark_closed();
        self.close_handle.cancel();
    }
}

/// Writer task: frames from the queue onto the stream, length-prefixed.
/// On close, flushes what is already queued before finishing the stream.
async fn write_loop(
    id: ChannelId,
    mut send: SendStream,
    mut worker: QueueWorker,
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
        if let Err(e) = write_frame(&mut send, &frame).await {
            debug!(channel = %id, error = %e, "channel write failed");
            worker.mark_closed();
            return;
        }
        worker.complete(frame.len());
    }

    // Flush frames accepted before the close.
    while let Some(frame) = worker.next_ready() {
        if write_frame(&mut send, &frame).await.is_err() {
            break;
        }
        worker.complete(frame.len());
    }
    worker.mark_closed();
    let _ = send.finish();
}

/// Reader task: length-prefixed frames off the stream into the inbox
async fn read_loop(
    id: ChannelId,
    mut recv: RecvStream,
    incoming: mpsc::UnboundedSender<Bytes>,
    queue: SendQueue,
) {
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(frame)) => {
                if incoming.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(channel = %id, "peer finished stream");
                break;
            }
            Err(e) => {
                warn!(channel = %id, error = %e, "channel read failed");
                break;
            }
        }
    }
    queue.mark_closed();
}

async fn write_frame(send: &mut SendStream, frame: &Bytes) -> TransportResult<()> {
    let len = (frame.len() as u32).to_be_bytes();
    send.write_all(&len)
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    send.write_all(frame)
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    Ok(())
}

async fn read_frame(recv: &mut RecvStream) -> TransportResult<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(e) => return Err(TransportError::Receive(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Receive(e.to_string()))?;
    Ok(Some(Bytes::from(buf)))
}

/// Skip TLS server verification; authenticity is established by the
/// hybrid key exchange riding the channels.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
