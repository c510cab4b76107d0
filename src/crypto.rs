//! Encryption at rest for storage entries that request it.
//!
//! AES-256-GCM with a key derived from the configured passphrase
//! (SHA-256). Output layout: `nonce (12 bytes) || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::storage::traits::StorageError;

const NONCE_LEN: usize = 12;

pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    /// Derive a cipher from a passphrase.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            inner: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .inner
            .encrypt(nonce, plaintext)
            .map_err(|e| StorageError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        if data.len() < NONCE_LEN {
            return Err(StorageError::Encryption("ciphertext shorter than nonce".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StorageError::Encryption("decryption failed (wrong key or corrupted entry)".into()))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(AES-256-GCM)")
    }
}
