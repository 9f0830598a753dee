//! XChaCha20-Poly1305 encryption for webhook secrets at rest.
//!
//! Blob layout: `[nonce: 24 bytes][ciphertext + Poly1305 tag]`.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use {rand::RngCore, thiserror::Error};

const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be 64 hex chars")]
    BadKey,

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("ciphertext too short")]
    TooShort,
}

/// Process-wide cipher derived from `ENCRYPTION_KEY`.
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    /// Build from a 64-char hex key.
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        if hex.len() != 64 {
            return Err(CryptoError::BadKey);
        }
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| CryptoError::BadKey)?;
        }
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + 16 {
            return Err(CryptoError::TooShort);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let cipher = XChaCha20Poly1305::new((&self.key).into());

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::Cipher(e.to_string()))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn round_trip() {
        let c = cipher();
        let secret = b"whsec_k3H9s2mQ";
        let blob = c.encrypt(secret).unwrap();
        assert_eq!(c.decrypt(&blob).unwrap(), secret);
    }

    #[test]
    fn nonces_differ_per_encryption() {
        let c = cipher();
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let blob = cipher().encrypt(b"secret").unwrap();
        let other = SecretCipher::from_hex(&"cd".repeat(32)).unwrap();
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn tampered_blob_fails() {
        let c = cipher();
        let mut blob = c.encrypt(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(c.decrypt(&blob).is_err());
    }

    #[test]
    fn short_blob_fails() {
        assert!(matches!(
            cipher().decrypt(&[0u8; 10]),
            Err(CryptoError::TooShort)
        ));
    }

    #[test]
    fn bad_hex_key_rejected() {
        assert!(SecretCipher::from_hex("short").is_err());
        assert!(SecretCipher::from_hex(&"zz".repeat(32)).is_err());
    }
}
