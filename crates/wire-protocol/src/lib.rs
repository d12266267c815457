//! Shared Protocol Definitions for Windrop
//!
//! This crate contains the wire formats, identifiers, transfer states and
//! error types shared across the Windrop transfer engine.

mod chunk;
mod error;
mod id;
mod message;
mod state;

pub use chunk::*;
pub use error::*;
pub use id::*;
pub use message::*;
pub use state::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// AEAD nonce length in bytes (4-byte prefix + 8-byte counter)
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Keyed content hash carried inside every encrypted chunk
pub const CHUNK_HASH_LEN: usize = 32;

/// Fixed chunk header: index (4) + total (4) + nonce (12)
pub const CHUNK_HEADER_LEN: usize = 4 + 4 + NONCE_LEN;

/// Smallest chunk size the adaptive controller may select
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size the adaptive controller may select
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Maximum data channels opened over one peer connection
pub const MAX_DATA_CHANNELS: usize = 4;

/// Upper bound on a single wire frame (chunk header + hash + payload + tag)
pub const MAX_FRAME_SIZE: usize = CHUNK_HEADER_LEN + CHUNK_HASH_LEN + MAX_CHUNK_SIZE + TAG_LEN;
