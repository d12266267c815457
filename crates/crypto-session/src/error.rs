//! Crypto session error types

use thiserror::Error;

/// Cryptographic operation error.
///
/// Messages never carry key material or plaintext; failures are
/// fail-secure and reported without detail an attacker could use.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Decryption failed: content hash mismatch")]
    ContentHashMismatch,

    #[error("Refusing to encrypt empty input")]
    EmptyPlaintext,

    #[error("Chunk exceeds maximum size: {size} bytes (max: {max})")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid ciphertext length: expected {expected}, got {actual}")]
    InvalidCiphertextLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Malformed sealed manifest")]
    MalformedManifest,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
