//! Onion-routed relay circuits
//!
//! Fallback path for peers that cannot reach each other directly. The
//! client builds a three-hop circuit by telescoping: a Create to the
//! entry node, then Extend commands tunneled through the partial circuit
//! for each further hop. Every hop holds one layer key from its own
//! hybrid key exchange, so no relay sees more than its neighbors.
//!
//! Chunk frames crossing a circuit stay end-to-end encrypted; the onion
//! layers wrap the already-sealed frames.

mod circuit;
mod directory;
mod error;
mod link;
mod node;
mod onion;

pub use circuit::*;
pub use directory::*;
pub use error::*;
pub use link::*;
pub use node::*;
pub use onion::*;

/// Largest cell a relay link will carry
pub const MAX_CELL_SIZE: usize = 64 * 1024;

/// Largest stream payload per fragment, leaving room for onion layers
/// and cell framing inside [`MAX_CELL_SIZE`]
pub const MAX_FRAGMENT_SIZE: usize = 48 * 1024;

/// Hops in a full circuit
pub const CIRCUIT_HOPS: usize = 3;
