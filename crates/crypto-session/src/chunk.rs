//! Chunk encryption and whole-file hashing
//!
//! Each chunk is sealed with ChaCha20Poly1305; the AAD binds the chunk to
//! its index and the declared total, and a keyed BLAKE3 hash of the
//! plaintext travels inside the envelope as an independent integrity
//! check. File metadata is sealed the same way under its own AAD domain,
//! so nothing on the wire reveals file identity.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use wire_protocol::{
    CHUNK_HASH_LEN, EncryptedChunk, FileManifest, MAX_CHUNK_SIZE, NONCE_LEN, TAG_LEN,
};
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, SessionKeys};

const MANIFEST_AAD: &[u8] = b"windrop-manifest-v1";

/// Seals and opens chunks under one session's keys
pub struct ChunkCipher {
    cipher: ChaCha20Poly1305,
    hash_key: Zeroizing<[u8; 32]>,
}

impl ChunkCipher {
    pub fn new(keys: &SessionKeys) -> CryptoResult<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(keys.encryption_key())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            cipher,
            hash_key: Zeroizing::new(*keys.authentication_key()),
        })
    }

    /// Encrypt one chunk with a caller-supplied unique nonce.
    ///
    /// The nonce must come from the session's [`crate::NonceSequence`];
    /// this function never invents one.
    pub fn encrypt_chunk(
        &self,
        plaintext: &[u8],
        index: u32,
        total: u32,
        nonce: [u8; NONCE_LEN],
    ) -> CryptoResult<EncryptedChunk> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }
        if plaintext.len() > MAX_CHUNK_SIZE {
            return Err(CryptoError::ChunkTooLarge {
                size: plaintext.len(),
                max: MAX_CHUNK_SIZE,
            });
        }

        let content_hash = blake3::keyed_hash(&self.hash_key, plaintext);

        let mut sealed = Zeroizing::new(Vec::with_capacity(CHUNK_HASH_LEN + plaintext.len()));
        sealed.extend_from_slice(content_hash.as_bytes());
        sealed.extend_from_slice(plaintext);

        let aad = EncryptedChunk::aad(index, total);
        let mut ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        let tag_offset = ciphertext.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&ciphertext[tag_offset..]);
        ciphertext.truncate(tag_offset);

        Ok(EncryptedChunk {
            index,
            total,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Decrypt and verify one chunk.
    ///
    /// Fail-secure: on tag or content-hash mismatch no plaintext is
    /// returned.
    pub fn decrypt_chunk(&self, chunk: &EncryptedChunk) -> CryptoResult<Vec<u8>> {
        let mut combined = Vec::with_capacity(chunk.ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(&chunk.ciphertext);
        combined.extend_from_slice(&chunk.tag);

        let aad = EncryptedChunk::aad(chunk.index, chunk.total);
        let sealed = Zeroizing::new(
            self.cipher
                .decrypt(
                    Nonce::from_slice(&chunk.nonce),
                    Payload {
                        msg: &combined,
                        aad: &aad,
                    },
                )
                .map_err(|_| CryptoError::DecryptionFailed)?,
        );

        if sealed.len() <= CHUNK_HASH_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (received_hash, plaintext) = sealed.split_at(CHUNK_HASH_LEN);

        let expected = blake3::keyed_hash(&self.hash_key, plaintext);
        // blake3::Hash equality is constant-time.
        let mut received = [0u8; CHUNK_HASH_LEN];
        received.copy_from_slice(received_hash);
        if expected != blake3::Hash::from_bytes(received) {
            return Err(CryptoError::ContentHashMismatch);
        }

        Ok(plaintext.to_vec())
    }

    /// Seal a manifest for the control channel
    pub fn seal_manifest(
        &self,
        manifest: &FileManifest,
        nonce: [u8; NONCE_LEN],
    ) -> CryptoResult<Vec<u8>> {
        let encoded = Zeroizing::new(
            manifest
                .to_bytes()
                .map_err(|_| CryptoError::MalformedManifest)?,
        );
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &encoded,
                    aad: MANIFEST_AAD,
                },
            )
            .map_err(|_| CryptoError::Encryption)
    }

    /// Open a sealed manifest received on the control channel
    pub fn open_manifest(
        &self,
        sealed: &[u8],
        nonce: [u8; NONCE_LEN],
    ) -> CryptoResult<FileManifest> {
        if sealed.len() <= TAG_LEN {
            return Err(CryptoError::MalformedManifest);
        }
        let encoded = Zeroizing::new(
            self.cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: sealed,
                        aad: MANIFEST_AAD,
                    },
                )
                .map_err(|_| CryptoError::DecryptionFailed)?,
        );
        FileManifest::from_bytes(&encoded).map_err(|_| CryptoError::MalformedManifest)
    }
}

/// Incremental keyed hash over the whole plaintext, fed in index order
pub struct FileHasher {
    inner: blake3::Hasher,
}

impl FileHasher {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            inner: blake3::Hasher::new_keyed(keys.authentication_key()),
        }
    }

    pub fn update(&mut self, plaintext: &[u8]) {
        self.inner.update(plaintext);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.inner.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Direction, HybridKeyPair, NonceSequence, encapsulate};

    fn test_keys() -> SessionKeys {
        let receiver = HybridKeyPair::generate();
        let (_, secret) =
            encapsulate(receiver.kem_public_bytes(), &receiver.ec_public_bytes()).unwrap();
        SessionKeys::derive(&secret).unwrap()
    }

    #[test]
    fn round_trip_across_sizes() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);

        for size in [1usize, 2, 16 * 1024, 64 * 1024, MAX_CHUNK_SIZE] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let chunk = cipher
                .encrypt_chunk(&plaintext, 0, 1, nonces.next().unwrap())
                .unwrap();
            let decrypted = cipher.decrypt_chunk(&chunk).unwrap();
            assert_eq!(decrypted, plaintext, "size {size}");
        }
    }

    #[test]
    fn empty_plaintext_is_rejected() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);
        let err = cipher
            .encrypt_chunk(&[], 0, 1, nonces.next().unwrap())
            .unwrap_err();
        assert!(matches!(err, CryptoError::EmptyPlaintext));
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);
        let err = cipher
            .encrypt_chunk(&vec![0u8; MAX_CHUNK_SIZE + 1], 0, 1, nonces.next().unwrap())
            .unwrap_err();
        assert!(matches!(err, CryptoError::ChunkTooLarge { .. }));
    }

    #[test]
    fn ciphertext_bit_flip_is_detected() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);

        let mut chunk = cipher
            .encrypt_chunk(b"payload under test", 2, 8, nonces.next().unwrap())
            .unwrap();
        chunk.ciphertext[5] ^= 0x40;
        let err = cipher.decrypt_chunk(&chunk).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn tag_bit_flip_is_detected() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);

        let mut chunk = cipher
            .encrypt_chunk(b"payload under test", 2, 8, nonces.next().unwrap())
            .unwrap();
        chunk.tag[0] ^= 0x01;
        assert!(cipher.decrypt_chunk(&chunk).is_err());
    }

    #[test]
    fn reindexed_chunk_fails_authentication() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);

        let mut chunk = cipher
            .encrypt_chunk(b"chunk bound to index 3", 3, 8, nonces.next().unwrap())
            .unwrap();
        // A relocated chunk must not decrypt at another position.
        chunk.index = 4;
        assert!(cipher.decrypt_chunk(&chunk).is_err());
    }

    #[test]
    fn manifest_seal_open_round_trip() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);

        let manifest = FileManifest {
            name: "report.pdf".into(),
            size: 10_485_760,
            mime: Some("application/pdf".into()),
            total_chunks: 160,
            file_hash: [9u8; 32],
        };

        let nonce = nonces.next().unwrap();
        let sealed = cipher.seal_manifest(&manifest, nonce).unwrap();
        let opened = cipher.open_manifest(&sealed, nonce).unwrap();
        assert_eq!(opened, manifest);
    }

    #[test]
    fn tampered_manifest_is_rejected() {
        let keys = test_keys();
        let cipher = ChunkCipher::new(&keys).unwrap();
        let mut nonces = NonceSequence::new(Direction::Initiator);

        let manifest = FileManifest {
            name: "secret.tar".into(),
            size: 4096,
            mime: None,
            total_chunks: 1,
            file_hash: [0u8; 32],
        };

        let nonce = nonces.next().unwrap();
        let mut sealed = cipher.seal_manifest(&manifest, nonce).unwrap();
        sealed[0] ^= 0x80;
        assert!(cipher.open_manifest(&sealed, nonce).is_err());
    }

    #[test]
    fn file_hasher_matches_one_shot_keyed_hash() {
        let keys = test_keys();
        let data = vec![0x5Au8; 100_000];

        let mut hasher = FileHasher::new(&keys);
        for part in data.chunks(7_000) {
            hasher.update(part);
        }
        let streamed = hasher.finalize();

        let one_shot = blake3::keyed_hash(keys.authentication_key(), &data);
        assert_eq!(&streamed, one_shot.as_bytes());
    }
}
