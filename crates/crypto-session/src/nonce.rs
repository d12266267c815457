//! Per-session nonce sequence
//!
//! Nonce format: `[4-byte random prefix][8-byte big-endian counter]`.
//! The prefix MSB carries the handshake direction, so both endpoints of a
//! session can encrypt under the same key without ever colliding. The
//! counter never wraps; exhaustion forces a new session.

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use wire_protocol::{NONCE_LEN, ProtocolError, ProtocolResult};

/// Direction of the handshake (affects the nonce prefix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// We initiated the transfer
    Initiator,
    /// We accepted the transfer
    Responder,
}

/// Serializable snapshot of a sequence, for pause/resume across
/// reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceState {
    pub prefix: [u8; 4],
    pub counter: u64,
}

/// Monotonic nonce generator for one session and one direction
#[derive(Debug)]
pub struct NonceSequence {
    prefix: [u8; 4],
    counter: u64,
}

impl NonceSequence {
    /// Create a sequence with a fresh random prefix for `direction`
    pub fn new(direction: Direction) -> Self {
        let mut prefix = [0u8; 4];
        OsRng.fill_bytes(&mut prefix);
        match direction {
            Direction::Initiator => prefix[0] &= 0x7F,
            Direction::Responder => prefix[0] |= 0x80,
        }
        Self { prefix, counter: 0 }
    }

    /// Rebuild a sequence from a saved snapshot; continues strictly after
    /// the saved counter
    pub fn resume(state: NonceState) -> Self {
        Self {
            prefix: state.prefix,
            counter: state.counter,
        }
    }

    /// Produce the next nonce and advance the counter.
    ///
    /// The final counter value is never issued: hitting it means the
    /// session has exhausted its nonce space and must be re-keyed.
    pub fn next(&mut self) -> ProtocolResult<[u8; NONCE_LEN]> {
        if self.counter == u64::MAX {
            return Err(ProtocolError::NonceExhausted);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    /// Snapshot for pause/resume
    pub fn state(&self) -> NonceState {
        NonceState {
            prefix: self.prefix,
            counter: self.counter,
        }
    }

    /// Nonces left before the sequence is exhausted
    pub fn remaining(&self) -> u64 {
        u64::MAX - self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn nonces_are_unique_and_counters_strictly_increase() {
        let mut seq = NonceSequence::new(Direction::Initiator);
        let mut seen = HashSet::with_capacity(100_000);
        let mut last_counter = None;

        for _ in 0..100_000 {
            let nonce = seq.next().unwrap();
            assert!(seen.insert(nonce), "nonce repeated");

            let counter = u64::from_be_bytes(nonce[4..].try_into().unwrap());
            if let Some(last) = last_counter {
                assert!(counter > last);
            }
            last_counter = Some(counter);
        }
    }

    #[test]
    fn prefix_is_stable_within_a_sequence() {
        let mut seq = NonceSequence::new(Direction::Responder);
        let first = seq.next().unwrap();
        let second = seq.next().unwrap();
        assert_eq!(first[..4], second[..4]);
        assert_ne!(first[4..], second[4..]);
    }

    #[test]
    fn direction_bit_separates_endpoints() {
        let initiator = NonceSequence::new(Direction::Initiator);
        let responder = NonceSequence::new(Direction::Responder);
        assert_eq!(initiator.state().prefix[0] & 0x80, 0);
        assert_eq!(responder.state().prefix[0] & 0x80, 0x80);
    }

    #[test]
    fn exhaustion_is_fatal_not_wrapping() {
        let mut seq = NonceSequence::resume(NonceState {
            prefix: [1, 2, 3, 4],
            counter: u64::MAX - 1,
        });
        seq.next().unwrap();
        let err = seq.next().unwrap_err();
        assert!(matches!(err, ProtocolError::NonceExhausted));
        // Still exhausted on retry.
        assert!(seq.next().is_err());
    }

    #[test]
    fn resume_continues_after_saved_counter() {
        let mut seq = NonceSequence::new(Direction::Initiator);
        for _ in 0..10 {
            seq.next().unwrap();
        }
        let snapshot = seq.state();

        let mut resumed = NonceSequence::resume(snapshot);
        let nonce = resumed.next().unwrap();
        let counter = u64::from_be_bytes(nonce[4..].try_into().unwrap());
        assert_eq!(counter, 10);
        assert_eq!(nonce[..4], snapshot.prefix);
    }

    #[test]
    fn state_snapshot_round_trips_through_serde() {
        let seq = NonceSequence::new(Direction::Responder);
        let state = seq.state();
        let encoded = bincode::serialize(&state).unwrap();
        let decoded: NonceState = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, state);
    }
}
