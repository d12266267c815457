//! Engine error type and failure classification

use crypto_session::CryptoError;
use net_transport::TransportError;
use relay_circuit::RelayError;
use thiserror::Error;
use wire_protocol::ProtocolError;

/// Anything that can end a transfer early
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Network(#[from] TransportError),

    #[error("Relay fallback failed: {0}")]
    Relay(#[from] RelayError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Resource limit: {0}")]
    Resource(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Coarse failure class driving the recovery decision.
///
/// Crypto and protocol failures mean the session itself is unsound and
/// abort the transfer outright. Network and timeout failures describe the
/// path, not the session, and permit one relay fallback. Resource
/// failures are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Crypto,
    Protocol,
    Network,
    Timeout,
    Resource,
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Network(TransportError::Timeout) => ErrorKind::Timeout,
            Self::Network(TransportError::Cancelled) => ErrorKind::Cancelled,
            Self::Network(_) => ErrorKind::Network,
            Self::Relay(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Resource(_) => ErrorKind::Resource,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the failure describes the transport path rather than the
    /// session, making a relay fallback worth attempting
    pub fn is_path_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout)
    }
}

/// Result type alias for engine operations
pub type TransferResult<T> = Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_failures_never_qualify_for_fallback() {
        let err = TransferError::Crypto(CryptoError::DecryptionFailed);
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(!err.is_path_failure());
    }

    #[test]
    fn transport_timeouts_classify_as_timeout() {
        let err = TransferError::Network(TransportError::Timeout);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_path_failure());

        let err = TransferError::Timeout("chunk progress");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_path_failure());
    }

    #[test]
    fn relay_failures_count_as_network() {
        let err = TransferError::Relay(RelayError::LinkClosed);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.is_path_failure());
    }

    #[test]
    fn cancellation_is_not_a_path_failure() {
        assert!(!TransferError::Cancelled.is_path_failure());
        let via_transport = TransferError::Network(TransportError::Cancelled);
        assert_eq!(via_transport.kind(), ErrorKind::Cancelled);
        assert!(!via_transport.is_path_failure());
    }
}
