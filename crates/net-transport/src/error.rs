//! Transport error types

use thiserror::Error;
use wire_protocol::ChannelId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Channel {0} closed unexpectedly")]
    ChannelClosed(ChannelId),

    #[error("All channels failed")]
    AllChannelsFailed,

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
