//! Control-channel messages

use serde::{Deserialize, Serialize};

use crate::{NONCE_LEN, PeerId, TransferId};

/// File metadata exchanged during negotiation.
///
/// Never leaves the host in the clear: the orchestrator seals it under the
/// session key before it is placed into [`ControlMessage::Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Original file name
    pub name: String,
    /// Total plaintext size in bytes
    pub size: u64,
    /// Optional MIME-type hint
    pub mime: Option<String>,
    /// Number of chunks the sender will produce
    pub total_chunks: u32,
    /// Keyed hash of the whole plaintext, in chunk-index order
    pub file_hash: [u8; 32],
}

impl FileManifest {
    /// Serialize to bytes (for sealing)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes (after opening)
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Messages exchanged on channel 0.
///
/// Everything before `KeyAnswer` is public key material; everything that
/// could identify the file travels sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Sender opens the exchange with its public keys
    KeyOffer {
        transfer_id: TransferId,
        peer_id: PeerId,
        protocol_version: u32,
        #[serde(with = "serde_bytes")]
        kem_public: Vec<u8>,
        ec_public: [u8; 32],
    },
    /// Receiver answers with the hybrid ciphertext (KEM-ct ‖ EC-pk)
    KeyAnswer {
        transfer_id: TransferId,
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },
    /// Sealed [`FileManifest`]
    Manifest {
        transfer_id: TransferId,
        nonce: [u8; NONCE_LEN],
        #[serde(with = "serde_bytes")]
        sealed: Vec<u8>,
    },
    /// Receiver accepted the offer and will open `data_channels` channels
    Accept {
        transfer_id: TransferId,
        data_channels: u8,
    },
    /// Receiver declined the offer
    Reject {
        transfer_id: TransferId,
        reason: String,
    },
    /// Sender is abandoning the direct path for a relay circuit. Sent as
    /// a farewell on the old control channel when that still works, and
    /// as the greeting on the new one; `data_channels` proposes the
    /// channel count for the relayed leg.
    Reconnect {
        transfer_id: TransferId,
        data_channels: u8,
    },
    /// Periodic receive-side progress, feeds the sender's adaptive control
    Feedback {
        transfer_id: TransferId,
        chunks_received: u32,
        highest_index: u32,
        bytes_received: u64,
    },
    /// Sender dispatched its final chunk
    SendDone {
        transfer_id: TransferId,
        chunks_sent: u32,
    },
    /// Receiver finished verification
    VerifyResult { transfer_id: TransferId, ok: bool },
    /// Either side tears the transfer down
    Cancel {
        transfer_id: TransferId,
        reason: String,
    },
    /// Ping for latency measurement
    Ping { seq: u64, timestamp_us: u64 },
    /// Pong response
    Pong { seq: u64, ping_timestamp_us: u64 },
}

impl ControlMessage {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

mod serde_bytes {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde::Deserialize::deserialize(deserializer)
    }
}
