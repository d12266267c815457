//! Onion layering and cell formats
//!
//! Forward cells carry a command sealed under the executing hop's layer
//! key, nested in one `Relay` envelope per intermediate hop. Backward
//! cells gain one layer per hop on the way to the client, which unwraps
//! as many layers as the circuit is long. A fresh random nonce prefixes
//! every layer, so relays never see repeated ciphertext structure.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use crypto_session::SessionSecret;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{MAX_CELL_SIZE, MAX_FRAGMENT_SIZE, RelayError, RelayResult};

const LAYER_SALT: &[u8] = b"windrop-onion-layer-v1";
const LAYER_INFO: &[u8] = b"windrop-onion-key";

/// Per-layer nonce plus AEAD tag
pub const LAYER_OVERHEAD: usize = 12 + 16;

/// Symmetric key shared with exactly one hop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LayerKey([u8; 32]);

impl LayerKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for LayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LayerKey(..)")
    }
}

/// Derive the layer key a hop shares with the client.
///
/// Both sides hold `secret` from the hop's own hybrid exchange; the hop
/// position salts the derivation, which is why Create cells carry it.
pub fn derive_layer_key(secret: &SessionSecret, hop: u8) -> LayerKey {
    let mut salt = Vec::with_capacity(LAYER_SALT.len() + 1);
    salt.extend_from_slice(LAYER_SALT);
    salt.push(hop);
    let hk = Hkdf::<Sha256>::new(Some(&salt), secret.as_bytes());
    let mut key = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length
    if hk.expand(LAYER_INFO, &mut key).is_err() {
        unreachable!("HKDF output length is fixed");
    }
    LayerKey(key)
}

/// Seal one onion layer: random nonce, then ciphertext and tag
pub fn wrap_layer(key: &LayerKey, plaintext: &[u8]) -> RelayResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| RelayError::LayerDecryption)?;
    let mut out = Vec::with_capacity(12 + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Remove one onion layer
pub fn unwrap_layer(key: &LayerKey, payload: &[u8]) -> RelayResult<Vec<u8>> {
    if payload.len() < LAYER_OVERHEAD {
        return Err(RelayError::MalformedCell);
    }
    let (nonce, sealed) = payload.split_at(12);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| RelayError::LayerDecryption)
}

/// Cells exchanged on relay links
#[derive(Debug, Serialize, Deserialize)]
pub enum RelayCell {
    /// Open a circuit at this hop; `handshake` is a hybrid ciphertext
    /// against the hop's published keys, `hop` its position in the route
    Create {
        circuit: u64,
        hop: u8,
        handshake: Vec<u8>,
    },
    Created {
        circuit: u64,
    },
    CreateFailed {
        circuit: u64,
        reason: String,
    },
    /// Onion payload moving toward the exit
    Forward {
        circuit: u64,
        payload: Vec<u8>,
    },
    /// Onion payload moving toward the client
    Backward {
        circuit: u64,
        payload: Vec<u8>,
    },
    /// Plain stream bytes between the exit and the target
    Data {
        payload: Vec<u8>,
    },
    Teardown {
        circuit: u64,
    },
}

impl RelayCell {
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_CELL_SIZE {
            return Err(RelayError::CellTooLarge {
                size: bytes.len(),
                max: MAX_CELL_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> RelayResult<RelayCell> {
        if bytes.len() > MAX_CELL_SIZE {
            return Err(RelayError::CellTooLarge {
                size: bytes.len(),
                max: MAX_CELL_SIZE,
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Commands found inside forward onion layers
#[derive(Debug, Serialize, Deserialize)]
pub enum RelayCommand {
    /// Dial `address` and create the next hop with `handshake`; `hop`
    /// is the new node's position for its key derivation
    Extend {
        address: String,
        hop: u8,
        handshake: Vec<u8>,
    },
    /// Pass the inner payload one hop further
    Relay(Vec<u8>),
    /// Exit only: dial the transfer target
    Connect { address: String },
    /// Exit only: hand stream bytes to the target
    Deliver(Vec<u8>),
}

/// Replies found inside backward onion layers
#[derive(Debug, Serialize, Deserialize)]
pub enum RelayReply {
    Extended,
    ExtendFailed(String),
    Connected,
    ConnectFailed(String),
    /// Stream bytes from the target
    Data(Vec<u8>),
    TargetClosed,
}

/// Seal `command` for the hop at `hop` (0 = entry), nesting a `Relay`
/// envelope per hop in front of it
pub fn wrap_for_hop(keys: &[LayerKey], hop: usize, command: &RelayCommand) -> RelayResult<Vec<u8>> {
    let mut payload = wrap_layer(&keys[hop], &bincode::serialize(command)?)?;
    for key in keys[..hop].iter().rev() {
        let relay = bincode::serialize(&RelayCommand::Relay(payload))?;
        payload = wrap_layer(key, &relay)?;
    }
    Ok(payload)
}

/// Unwrap a backward payload that traversed `depth` hops and decode the
/// reply the deepest of them sealed
pub fn unwrap_reply(keys: &[LayerKey], depth: usize, payload: &[u8]) -> RelayResult<RelayReply> {
    let mut current = payload.to_vec();
    for key in &keys[..depth] {
        current = unwrap_layer(key, &current)?;
    }
    Ok(bincode::deserialize(&current)?)
}

/// One fragment of a multiplexed stream frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    pub stream: u16,
    pub message: u64,
    pub index: u16,
    pub count: u16,
    pub fin: bool,
    pub payload: Vec<u8>,
}

/// Splits frames into cell-sized fragments
#[derive(Default)]
pub struct Fragmenter {
    next_message: u64,
}

impl Fragmenter {
    pub fn split(&mut self, stream: u16, data: &[u8]) -> Vec<StreamFrame> {
        let message = self.next_message;
        self.next_message += 1;

        let count = data.len().div_ceil(MAX_FRAGMENT_SIZE).max(1) as u16;
        if data.is_empty() {
            return vec![StreamFrame {
                stream,
                message,
                index: 0,
                count: 1,
                fin: false,
                payload: Vec::new(),
            }];
        }
        data.chunks(MAX_FRAGMENT_SIZE)
            .enumerate()
            .map(|(index, part)| StreamFrame {
                stream,
                message,
                index: index as u16,
                count,
                fin: false,
                payload: part.to_vec(),
            })
            .collect()
    }

    /// End-of-stream marker for `stream`
    pub fn fin(&mut self, stream: u16) -> StreamFrame {
        let message = self.next_message;
        self.next_message += 1;
        StreamFrame {
            stream,
            message,
            index: 0,
            count: 1,
            fin: true,
            payload: Vec::new(),
        }
    }
}

/// One frame restored from its fragments
#[derive(Debug)]
pub struct StreamMessage {
    pub stream: u16,
    pub fin: bool,
    pub data: Vec<u8>,
}

struct Partial {
    count: u16,
    received: u16,
    fin: bool,
    parts: Vec<Option<Vec<u8>>>,
}

/// Restores frames from fragments arriving in any order
#[derive(Default)]
pub struct Reassembler {
    partial: std::collections::HashMap<(u16, u64), Partial>,
}

impl Reassembler {
    pub fn push(&mut self, frame: StreamFrame) -> RelayResult<Option<StreamMessage>> {
        if frame.count == 0 || frame.index >= frame.count {
            return Err(RelayError::Reassembly(format!(
                "fragment {}/{} out of range",
                frame.index, frame.count
            )));
        }
        if frame.count == 1 {
            return Ok(Some(StreamMessage {
                stream: frame.stream,
                fin: frame.fin,
                data: frame.payload,
            }));
        }

        let key = (frame.stream, frame.message);
        if self
            .partial
            .get(&key)
            .is_some_and(|p| p.count != frame.count)
        {
            self.partial.remove(&key);
            return Err(RelayError::Reassembly(
                "fragment count changed mid-message".to_string(),
            ));
        }
        let partial = self.partial.entry(key).or_insert_with(|| Partial {
            count: frame.count,
            received: 0,
            fin: false,
            parts: vec![None; frame.count as usize],
        });
        let slot = &mut partial.parts[frame.index as usize];
        if slot.is_some() {
            return Err(RelayError::Reassembly(format!(
                "duplicate fragment {}",
                frame.index
            )));
        }
        *slot = Some(frame.payload);
        partial.received += 1;
        partial.fin |= frame.fin;

        if partial.received < partial.count {
            return Ok(None);
        }
        let Some(partial) = self.partial.remove(&key) else {
            return Ok(None);
        };
        let mut data = Vec::new();
        for part in partial.parts {
            match part {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => return Err(RelayError::Reassembly("missing fragment".to_string())),
            }
        }
        Ok(Some(StreamMessage {
            stream: frame.stream,
            fin: partial.fin,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(n: usize) -> Vec<LayerKey> {
        (0..n)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[0] = i as u8 + 1;
                LayerKey::from_bytes(bytes)
            })
            .collect()
    }

    #[test]
    fn layer_round_trip() {
        let keys = test_keys(1);
        let sealed = wrap_layer(&keys[0], b"inner").unwrap();
        assert_eq!(sealed.len(), 5 + LAYER_OVERHEAD);
        assert_eq!(unwrap_layer(&keys[0], &sealed).unwrap(), b"inner");
    }

    #[test]
    fn wrong_key_cannot_unwrap() {
        let keys = test_keys(2);
        let sealed = wrap_layer(&keys[0], b"inner").unwrap();
        assert!(matches!(
            unwrap_layer(&keys[1], &sealed),
            Err(RelayError::LayerDecryption)
        ));
    }

    #[test]
    fn forward_onion_peels_hop_by_hop() {
        let keys = test_keys(3);
        let command = RelayCommand::Deliver(b"payload".to_vec());
        let mut payload = wrap_for_hop(&keys, 2, &command).unwrap();

        for key in &keys[..2] {
            let inner = unwrap_layer(key, &payload).unwrap();
            match bincode::deserialize::<RelayCommand>(&inner).unwrap() {
                RelayCommand::Relay(next) => payload = next,
                other => panic!("expected relay envelope, got {other:?}"),
            }
        }
        let inner = unwrap_layer(&keys[2], &payload).unwrap();
        assert!(matches!(
            bincode::deserialize::<RelayCommand>(&inner).unwrap(),
            RelayCommand::Deliver(data) if data == b"payload"
        ));
    }

    #[test]
    fn backward_reply_unwraps_at_circuit_depth() {
        let keys = test_keys(3);
        let reply = bincode::serialize(&RelayReply::Data(b"result".to_vec())).unwrap();
        let mut payload = wrap_layer(&keys[2], &reply).unwrap();
        payload = wrap_layer(&keys[1], &payload).unwrap();
        payload = wrap_layer(&keys[0], &payload).unwrap();

        assert!(matches!(
            unwrap_reply(&keys, 3, &payload).unwrap(),
            RelayReply::Data(data) if data == b"result"
        ));
    }

    #[test]
    fn fragments_reassemble_out_of_order() {
        let data: Vec<u8> = (0..100 * 1024).map(|i| (i % 241) as u8).collect();
        let mut fragmenter = Fragmenter::default();
        let mut frames = fragmenter.split(7, &data);
        assert_eq!(frames.len(), 3);
        frames.reverse();

        let mut reassembler = Reassembler::default();
        let mut restored = None;
        for frame in frames {
            if let Some(message) = reassembler.push(frame).unwrap() {
                restored = Some(message);
            }
        }
        let message = restored.unwrap();
        assert_eq!(message.stream, 7);
        assert_eq!(message.data, data);
        assert!(!message.fin);
    }

    #[test]
    fn duplicate_fragment_is_rejected() {
        let data = vec![1u8; MAX_FRAGMENT_SIZE + 1];
        let mut fragmenter = Fragmenter::default();
        let frames = fragmenter.split(1, &data);
        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(frames[0].clone()).unwrap().is_none());
        assert!(reassembler.push(frames[0].clone()).is_err());
    }

    #[test]
    fn oversized_cell_is_rejected() {
        let cell = RelayCell::Forward {
            circuit: 1,
            payload: vec![0u8; MAX_CELL_SIZE + 1],
        };
        assert!(matches!(
            cell.encode(),
            Err(RelayError::CellTooLarge { .. })
        ));
    }

    #[test]
    fn derived_layer_keys_differ_per_hop() {
        let keypair = crypto_session::HybridKeyPair::generate();
        let (_, secret) =
            crypto_session::encapsulate(keypair.kem_public_bytes(), &keypair.ec_public_bytes())
                .unwrap();
        let sealed_a = wrap_layer(&derive_layer_key(&secret, 0), b"x").unwrap();
        assert!(unwrap_layer(&derive_layer_key(&secret, 1), &sealed_a).is_err());
        assert!(unwrap_layer(&derive_layer_key(&secret, 0), &sealed_a).is_ok());
    }
}
