//! Session key derivation

use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, SESSION_ID_SIZE, SYMMETRIC_KEY_SIZE, SessionSecret};

const ENCRYPTION_INFO: &[u8] = b"windrop-encryption-key-v1";
const AUTHENTICATION_INFO: &[u8] = b"windrop-authentication-key-v1";

/// Symmetric material for one session, derived exactly once from the
/// hybrid shared secret. Key bytes are wiped on drop.
pub struct SessionKeys {
    encryption_key: Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>,
    authentication_key: Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>,
    session_id: [u8; SESSION_ID_SIZE],
}

impl SessionKeys {
    /// Derive the encryption and authentication keys with domain-separated
    /// info strings, plus a random session id for log correlation.
    pub fn derive(secret: &SessionSecret) -> CryptoResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());

        let mut encryption_key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        hkdf.expand(ENCRYPTION_INFO, encryption_key.as_mut())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let mut authentication_key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        hkdf.expand(AUTHENTICATION_INFO, authentication_key.as_mut())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let mut session_id = [0u8; SESSION_ID_SIZE];
        OsRng.fill_bytes(&mut session_id);

        let keys = Self {
            encryption_key,
            authentication_key,
            session_id,
        };
        tracing::debug!(session_id = %keys.session_id_hex(), "session keys derived");
        Ok(keys)
    }

    pub fn encryption_key(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.encryption_key
    }

    pub fn authentication_key(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.authentication_key
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.session_id
    }

    /// Session id as lowercase hex, safe to log
    pub fn session_id_hex(&self) -> String {
        self.session_id
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_id", &self.session_id_hex())
            .finish_non_exhaustive()
    }
}
