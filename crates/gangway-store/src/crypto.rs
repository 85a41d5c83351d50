//! Authenticated encryption for API keys at rest.
//!
//! AES-256-GCM with a process-wide key. The 12-byte nonce is generated
//! fresh per encryption and prepended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{StoreError, StoreResult};

const NONCE_LEN: usize = 12;

/// Process-wide symmetric key, parsed once from hex configuration.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EncryptionKey(bytes)
    }

    pub fn from_hex(s: &str) -> StoreResult<Self> {
        let decoded =
            hex::decode(s.trim()).map_err(|e| StoreError::Crypto(format!("decode hex key: {e}")))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| StoreError::Crypto("encryption key must be 32 bytes".to_string()))?;
        Ok(EncryptionKey(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> StoreResult<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|e| StoreError::Crypto(format!("encrypt: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(data: &[u8], key: &EncryptionKey) -> StoreResult<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(StoreError::Crypto("ciphertext too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| StoreError::Crypto(format!("decrypt: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes([7u8; 32])
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let plaintext = b"0123456789abcdef0123456789abcdef";
        let encrypted = encrypt(plaintext, &key).unwrap();
        assert_ne!(&encrypted[NONCE_LEN..], plaintext.as_slice());
        assert_eq!(decrypt(&encrypted, &key).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_empty_and_binary() {
        let key = test_key();
        for plaintext in [vec![], vec![0u8; 64], (0..=255u8).collect::<Vec<_>>()] {
            let encrypted = encrypt(&plaintext, &key).unwrap();
            assert_eq!(decrypt(&encrypted, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonce_is_fresh_per_encryption() {
        let key = test_key();
        let a = encrypt(b"same", &key).unwrap();
        let b = encrypt(b"same", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let key = test_key();
        let mut encrypted = encrypt(b"payload", &key).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;
        assert!(decrypt(&encrypted, &key).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let encrypted = encrypt(b"payload", &test_key()).unwrap();
        let other = EncryptionKey::from_bytes([8u8; 32]);
        assert!(decrypt(&encrypted, &other).is_err());
    }

    #[test]
    fn hex_key_parsing() {
        assert!(EncryptionKey::from_hex(&"ab".repeat(32)).is_ok());
        assert!(EncryptionKey::from_hex("abcd").is_err());
        assert!(EncryptionKey::from_hex("not hex at all!").is_err());
    }
}
