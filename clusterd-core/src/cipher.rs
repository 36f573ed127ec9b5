//! Cluster key and message encryption: ChaCha20-Poly1305 tokens keyed by the shared secret.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// First byte of every decoded token.
pub const TOKEN_VERSION: u8 = 0x80;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 256-bit message key derived from the cluster's shared secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterKey([u8; 32]);

impl ClusterKey {
    /// Derive the message key from the configured secret string.
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        if secret.is_empty() {
            return Err(CipherError::Key);
        }
        let mut hasher = Sha256::new();
        hasher.update(b"clusterd-key-v1");
        hasher.update(secret.as_bytes());
        Ok(ClusterKey(hasher.finalize().into()))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CipherError> {
        ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CipherError::Key)
    }
}

impl fmt::Debug for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClusterKey(..)")
    }
}

/// Encrypt `plaintext` into a self-describing token:
/// base64url(version || nonce || ciphertext+tag). Nonce is random per message.
pub fn encrypt(key: &ClusterKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    let sealed = key
        .cipher()?
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::Encrypt)?;

    let mut raw = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
    raw.push(TOKEN_VERSION);
    raw.extend_from_slice(&nonce_bytes);
    raw.extend_from_slice(&sealed);
    Ok(URL_SAFE.encode(raw).into_bytes())
}

/// Decrypt a token produced by [`encrypt`]. Bad encoding, unknown version or a failed
/// authentication tag all come back as an error, never as plaintext.
pub fn decrypt(key: &ClusterKey, token: &[u8]) -> Result<Vec<u8>, CipherError> {
    let raw = URL_SAFE.decode(token).map_err(|_| CipherError::Malformed)?;
    if raw.len() < 1 + NONCE_LEN + TAG_LEN || raw[0] != TOKEN_VERSION {
        return Err(CipherError::Malformed);
    }
    let nonce = chacha20poly1305::Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
    key.cipher()?
        .decrypt(nonce, &raw[1 + NONCE_LEN..])
        .map_err(|_| CipherError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("malformed token")]
    Malformed,
    #[error("decryption failed")]
    Decrypt,
}

impl CipherError {
    /// True for failures caused by the received token (wrong key, forged or corrupted data).
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, CipherError::Malformed | CipherError::Decrypt)
    }
}
