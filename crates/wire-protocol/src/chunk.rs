//! Encrypted chunk wire codec
//!
//! Layout is bit-exact and stable:
//! `index (4 bytes BE) ‖ total (4 bytes BE) ‖ nonce (12 bytes) ‖ ciphertext ‖ tag (16 bytes)`.
//! The ciphertext itself carries a 32-byte keyed content hash ahead of the
//! payload, so the smallest valid ciphertext is 33 bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    CHUNK_HASH_LEN, CHUNK_HEADER_LEN, MAX_FRAME_SIZE, NONCE_LEN, ProtocolError, ProtocolResult,
    TAG_LEN,
};

/// One encrypted unit of file data as it travels a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    /// Position within the file, `0..total`
    pub index: u32,
    /// Total chunk count declared by the sender
    pub total: u32,
    /// AEAD nonce used for this chunk
    pub nonce: [u8; NONCE_LEN],
    /// Sealed content hash + payload
    pub ciphertext: Vec<u8>,
    /// Poly1305 tag over ciphertext and chunk header AAD
    pub tag: [u8; TAG_LEN],
}

impl EncryptedChunk {
    /// Total bytes this chunk occupies on the wire
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_LEN + self.ciphertext.len() + TAG_LEN
    }

    /// Encode into the wire layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.index);
        buf.put_u32(self.total);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.ciphertext);
        buf.put_slice(&self.tag);
        buf.freeze()
    }

    /// Decode from the wire layout, validating sizes and index bounds
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        // Header, a hash-only ciphertext of one payload byte, and the tag.
        let min = CHUNK_HEADER_LEN + CHUNK_HASH_LEN + 1 + TAG_LEN;
        if frame.len() < min {
            return Err(ProtocolError::FrameTooShort {
                size: frame.len(),
                min,
            });
        }

        let index = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let total = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if total == 0 || index >= total {
            return Err(ProtocolError::InvalidChunkIndex { index, total });
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&frame[8..8 + NONCE_LEN]);

        let body = &frame[CHUNK_HEADER_LEN..];
        let (ciphertext, tag_bytes) = body.split_at(body.len() - TAG_LEN);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(tag_bytes);

        Ok(Self {
            index,
            total,
            nonce,
            ciphertext: ciphertext.to_vec(),
            tag,
        })
    }

    /// Associated data binding a chunk to its position in the file
    pub fn aad(index: u32, total: u32) -> [u8; 8] {
        let mut aad = [0u8; 8];
        aad[..4].copy_from_slice(&index.to_be_bytes());
        aad[4..].copy_from_slice(&total.to_be_bytes());
        aad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> EncryptedChunk {
        EncryptedChunk {
            index: 3,
            total: 10,
            nonce: [7u8; NONCE_LEN],
            ciphertext: vec![0xAB; CHUNK_HASH_LEN + 100],
            tag: [0xCD; TAG_LEN],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let chunk = sample_chunk();
        let wire = chunk.encode();
        assert_eq!(wire.len(), chunk.encoded_len());
        let decoded = EncryptedChunk::decode(&wire).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn layout_is_big_endian_header_first() {
        let chunk = sample_chunk();
        let wire = chunk.encode();
        assert_eq!(&wire[..4], &3u32.to_be_bytes());
        assert_eq!(&wire[4..8], &10u32.to_be_bytes());
        assert_eq!(&wire[8..20], &[7u8; NONCE_LEN]);
        assert_eq!(&wire[wire.len() - TAG_LEN..], &[0xCD; TAG_LEN]);
    }

    #[test]
    fn rejects_index_out_of_range() {
        let mut chunk = sample_chunk();
        chunk.index = 10;
        let wire = chunk.encode();
        let err = EncryptedChunk::decode(&wire).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidChunkIndex {
                index: 10,
                total: 10
            }
        ));
    }

    #[test]
    fn rejects_zero_total() {
        let mut chunk = sample_chunk();
        chunk.total = 0;
        chunk.index = 0;
        let wire = chunk.encode();
        assert!(EncryptedChunk::decode(&wire).is_err());
    }

    #[test]
    fn rejects_truncated_frame() {
        let wire = sample_chunk().encode();
        let err = EncryptedChunk::decode(&wire[..CHUNK_HEADER_LEN + 8]).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooShort { .. }));
    }

    #[test]
    fn aad_binds_index_and_total() {
        assert_ne!(EncryptedChunk::aad(0, 4), EncryptedChunk::aad(1, 4));
        assert_ne!(EncryptedChunk::aad(0, 4), EncryptedChunk::aad(0, 5));
    }
}
