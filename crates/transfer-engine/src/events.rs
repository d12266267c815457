//! Progress events emitted while a transfer runs

use wire_protocol::TransferState;

use crate::benchmark::TransferReport;
use crate::error::ErrorKind;

/// Emitted on the transfer's event channel as it advances.
///
/// The channel is unbounded; the engine never blocks on a slow listener.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The state machine advanced
    StateChanged {
        from: TransferState,
        to: TransferState,
    },
    /// Bytes confirmed by the receive side
    Progress {
        bytes: u64,
        chunks: u32,
        total_chunks: u32,
    },
    /// The direct path was abandoned for a relay circuit. The route lists
    /// relay IDs on the side that built the circuit and is empty on the
    /// target side, which never learns the hops.
    PathSwitched { route: Vec<String> },
    /// Terminal success, with the measured numbers
    Completed(TransferReport),
    /// Terminal failure
    Failed { kind: ErrorKind, message: String },
}
