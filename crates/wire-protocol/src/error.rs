//! Error types for the protocol

use thiserror::Error;

/// Protocol error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Invalid peer ID format")]
    InvalidPeerId,

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame too short: {size} bytes (min: {min})")]
    FrameTooShort { size: usize, min: usize },

    #[error("Chunk index {index} out of range for total {total}")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("Duplicate chunk {0}")]
    DuplicateChunk(u32),

    #[error("Chunk total changed mid-transfer: declared {declared}, got {got}")]
    TotalMismatch { declared: u32, got: u32 },

    #[error("Assembly incomplete: {received}/{total} chunks")]
    IncompleteAssembly { received: u32, total: u32 },

    #[error("Nonce counter exhausted; session must be re-keyed")]
    NonceExhausted,

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::TransferState,
        to: crate::TransferState,
    },

    #[error("Unexpected message during {0}")]
    UnexpectedMessage(&'static str),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
