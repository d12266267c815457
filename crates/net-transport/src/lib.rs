//! Network Transport - parallel channel plumbing for Windrop
//!
//! Provides the frame-channel abstraction, a QUIC backend with one
//! bidirectional stream per channel, an in-memory backend for tests, the
//! parallel chunk coordinator and the adaptive chunk-size controller.

mod adaptive;
mod cancel;
mod channel;
mod coordinator;
mod error;
mod mem;
mod quic;

pub use adaptive::*;
pub use cancel::*;
pub use channel::*;
pub use coordinator::*;
pub use error::*;
pub use mem::*;
pub use quic::*;

/// Default QUIC port
pub const DEFAULT_QUIC_PORT: u16 = 47823;

/// Buffered bytes at which a channel stops accepting chunks
pub const HIGH_WATERMARK: usize = 16 * 1024 * 1024;

/// Buffered bytes below which a paused channel resumes
pub const LOW_WATERMARK: usize = 4 * 1024 * 1024;

/// Length prefix in front of every frame on a stream
pub const FRAME_HEADER_LEN: usize = 4;
