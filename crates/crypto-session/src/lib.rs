//! Crypto Session - End-to-End Encryption for Windrop
//!
//! Hybrid ML-KEM-768 + X25519 key exchange with ChaCha20Poly1305 chunk
//! encryption and keyed BLAKE3 content hashes.

mod chunk;
mod error;
mod hybrid;
mod keys;
mod nonce;

pub use chunk::*;
pub use error::*;
pub use hybrid::*;
pub use keys::*;
pub use nonce::*;

pub use wire_protocol::{NONCE_LEN, TAG_LEN};

/// ML-KEM-768 public key size
pub const KEM_PUBLIC_KEY_SIZE: usize = 1184;

/// ML-KEM-768 secret key size
pub const KEM_SECRET_KEY_SIZE: usize = 2400;

/// ML-KEM-768 ciphertext size
pub const KEM_CIPHERTEXT_SIZE: usize = 1088;

/// X25519 public key size (256 bits / 32 bytes)
pub const EC_PUBLIC_KEY_SIZE: usize = 32;

/// Hybrid key-exchange ciphertext: KEM ciphertext followed by EC public key
pub const HYBRID_CIPHERTEXT_SIZE: usize = KEM_CIPHERTEXT_SIZE + EC_PUBLIC_KEY_SIZE;

/// Combined shared secret size (256 bits / 32 bytes)
pub const SHARED_SECRET_SIZE: usize = 32;

/// Symmetric key size (256 bits / 32 bytes)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Session id size carried in [`SessionKeys`]
pub const SESSION_ID_SIZE: usize = 16;
