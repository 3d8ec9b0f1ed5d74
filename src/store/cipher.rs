// Authenticated encryption for persisted blobs
// Blob layout: 24-byte random nonce || XChaCha20-Poly1305 ciphertext

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use std::fmt;
use zeroize::Zeroizing;

use super::StoreError;

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes, prepended to every blob
pub const NONCE_LEN: usize = 24;

/// 32-byte store key, wiped from memory on drop
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Copy a key out of `bytes`, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != KEY_LEN {
            return Err(StoreError::InvalidKeyLength(bytes.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Fresh random key from the OS generator
    pub fn generate() -> Self {
        let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(generated.as_slice());
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.0.as_slice()))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypt `plaintext` under a fresh random nonce
pub(crate) fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext)
        .map_err(|_| StoreError::Encryption)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(nonce.as_slice());
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a `nonce || ciphertext` blob, failing closed on any tampering
pub(crate) fn open(key: &EncryptionKey, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    if blob.len() < NONCE_LEN {
        return Err(StoreError::Decryption(
            "data too short to contain nonce".to_string(),
        ));
    }

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| StoreError::Decryption("authentication failed".to_string()))
}
