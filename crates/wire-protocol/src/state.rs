//! Transfer lifecycle states

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, ProtocolResult};

/// Direction of a transfer from the local peer's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Created, nothing exchanged yet
    Idle,
    /// Hybrid key exchange in flight
    KeyExchange,
    /// Keys derived; exchanging metadata and opening channels
    Negotiating,
    /// Chunks moving across data channels
    Transferring,
    /// All chunks moved; whole-file hash being checked
    Verifying,
    /// Terminal: file verified
    Complete,
    /// Terminal: unrecoverable error
    Failed,
    /// Terminal: cancelled by the caller
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Failure and cancellation are reachable from every non-terminal
    /// state; the forward path is strictly ordered.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;

        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (_, Failed) | (_, Cancelled) => true,
            (Idle, KeyExchange) => true,
            (KeyExchange, Negotiating) => true,
            (Negotiating, Transferring) => true,
            (Transferring, Verifying) => true,
            (Verifying, Complete) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::KeyExchange => "key-exchange",
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Validated state holder for one transfer.
///
/// Every mutation goes through [`StateMachine::transition`], so an illegal
/// jump is caught where it is attempted instead of surfacing later as an
/// inconsistent session.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    current: TransferState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: TransferState::Idle,
        }
    }

    pub fn current(&self) -> TransferState {
        self.current
    }

    pub fn transition(&mut self, next: TransferState) -> ProtocolResult<TransferState> {
        if !self.current.can_transition_to(next) {
            return Err(ProtocolError::InvalidStateTransition {
                from: self.current,
                to: next,
            });
        }
        let previous = self.current;
        self.current = next;
        Ok(previous)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
