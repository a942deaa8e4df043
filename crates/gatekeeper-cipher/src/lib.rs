//! Seals upstream credentials at rest.
//!
//! The key is derived by hashing the configured secret with SHA-256, the
//! same derivation the system this proxy replaces used to turn an arbitrary
//! operator-supplied string into a fixed-size AEAD key. Each `seal` draws a
//! fresh random 96-bit nonce and prepends it to the ciphertext; `unseal`
//! reads it back off the front.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyCipherError {
    #[error("encryption secret must be at least {MIN_SECRET_LEN} bytes")]
    SecretTooShort,
    #[error("ciphertext is malformed or truncated")]
    Malformed,
    #[error("ciphertext failed authentication (wrong key or tampered)")]
    Integrity,
}

/// Symmetric seal/unseal over a single process-wide secret.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn new(secret: &str) -> Result<Self, KeyCipherError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(KeyCipherError::SecretTooShort);
        }
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypts `plaintext`, returning a URL-safe base64 string of
    /// `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &str) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // AES-256-GCM encryption of a caller-supplied key cannot fail.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption is infallible for well-formed input");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(out)
    }

    pub fn unseal(&self, sealed: &str) -> Result<String, KeyCipherError> {
        let raw = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| KeyCipherError::Malformed)?;
        if raw.len() <= NONCE_LEN {
            return Err(KeyCipherError::Malformed);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| KeyCipherError::Integrity)?;
        String::from_utf8(plaintext).map_err(|_| KeyCipherError::Integrity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_plaintext() {
        let cipher = KeyCipher::new(&"a".repeat(32)).unwrap();
        let sealed = cipher.seal("sk-upstream-abc123");
        assert_eq!(cipher.unseal(&sealed).unwrap(), "sk-upstream-abc123");
    }

    #[test]
    fn two_seals_of_same_plaintext_differ() {
        let cipher = KeyCipher::new(&"a".repeat(32)).unwrap();
        assert_ne!(cipher.seal("same"), cipher.seal("same"));
    }

    #[test]
    fn rejects_short_secret() {
        assert!(matches!(KeyCipher::new("short"), Err(KeyCipherError::SecretTooShort)));
    }

    #[test]
    fn unseal_with_wrong_key_fails_integrity() {
        let a = KeyCipher::new(&"a".repeat(32)).unwrap();
        let b = KeyCipher::new(&"b".repeat(32)).unwrap();
        let sealed = a.seal("secret");
        assert!(matches!(b.unseal(&sealed), Err(KeyCipherError::Integrity)));
    }

    #[test]
    fn unseal_of_garbage_is_malformed_or_integrity_error() {
        let cipher = KeyCipher::new(&"a".repeat(32)).unwrap();
        assert!(cipher.unseal("not-even-base64!!").is_err());
    }
}
