//! Secrets and their at-rest encryption.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use stratum_core::{Result, StratumError};

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"stratum/secret-key/v1\0";

/// A sensitive string.
///
/// The plaintext is only reachable through [`Secret::expose`]; `Debug`
/// output is redacted. Two secrets are equal when their plaintexts are.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Arc<str>);

impl Secret {
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self(Arc::from(plaintext.into()))
    }

    /// The plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Authenticated encryption for secrets, keyed from a passphrase.
///
/// Each encryption draws a fresh random nonce, so the same plaintext
/// encrypts differently every time. The encoded form is
/// `base64(nonce || ciphertext)`.
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();

        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(digest.as_slice())),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| StratumError::Secret("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| StratumError::Secret(format!("malformed ciphertext: {e}")))?;
        if sealed.len() < NONCE_LEN {
            return Err(StratumError::Secret("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                StratumError::Secret("decryption failed (wrong passphrase?)".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| StratumError::Secret("decrypted secret is not UTF-8".to_string()))
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}
