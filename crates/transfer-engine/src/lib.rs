//! Transfer orchestration for windrop.
//!
//! This crate ties the other layers into one driver per transfer. The
//! sender walks key exchange, manifest negotiation, parallel encrypted
//! streaming and whole-file verification over any [`PeerLink`]; the
//! receiver mirrors it and hands back the reassembled file. When the
//! direct path stalls or drops mid-transfer, both sides restart the
//! data leg over a relay circuit exactly once.
//!
//! The entry points are [`Engine::initiate_transfer`] and
//! [`Engine::accept_transfer`]; everything else is plumbing behind the
//! returned handles.

mod backend;
mod benchmark;
mod config;
mod engine;
mod error;
mod events;
mod logging;
mod receiver;
mod sender;
mod session;

pub use backend::*;
pub use benchmark::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use logging::*;
pub use receiver::*;
pub use sender::*;
pub use session::*;
