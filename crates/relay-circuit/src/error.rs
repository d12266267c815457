//! Error types for relay circuits

use thiserror::Error;

/// Relay circuit error
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Not enough relays: need {need}, directory has {have}")]
    NotEnoughRelays { need: usize, have: usize },

    #[error("Circuit build failed after {attempts} attempts: {reason}")]
    CircuitBuild { attempts: usize, reason: String },

    #[error("Hop refused: {0}")]
    HopRefused(String),

    #[error("Cell too large: {size} bytes (max: {max})")]
    CellTooLarge { size: usize, max: usize },

    #[error("Malformed cell")]
    MalformedCell,

    #[error("Layer decryption failed")]
    LayerDecryption,

    #[error("Unknown circuit {0}")]
    UnknownCircuit(u64),

    #[error("Fragment reassembly failed: {0}")]
    Reassembly(String),

    #[error("Relay connection failed: {0}")]
    Connection(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Relay link closed")]
    LinkClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Crypto failure: {0}")]
    Crypto(#[from] crypto_session::CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
