//! ChaCha20-Poly1305 authenticated encryption.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes, appended to the ciphertext.
pub const TAG_SIZE: usize = 16;

/// Output of [`encrypt`]: a fresh nonce plus ciphertext-with-tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypts `plaintext` under `key` with a random nonce.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedData { nonce, ciphertext })
}

/// Decrypts and authenticates `data` under `key`.
pub fn decrypt(key: &DerivedKey, data: &EncryptedData) -> CryptoResult<Vec<u8>> {
    if data.ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::Decryption("ciphertext shorter than tag".to_string()));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&data.nonce), data.ciphertext.as_ref())
        .map_err(|_| {
            CryptoError::Decryption(
                "authentication failed (wrong key or tampered data)".to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::generate_random_key;

    #[test]
    fn roundtrip() {
        let key = generate_random_key();
        let sealed = encrypt(&key, b"drawer opened").unwrap();
        assert_eq!(sealed.ciphertext.len(), b"drawer opened".len() + TAG_SIZE);
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"drawer opened");
    }

    #[test]
    fn nonces_are_fresh() {
        let key = generate_random_key();
        let a = encrypt(&key, b"x").unwrap();
        let b = encrypt(&key, b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = generate_random_key();
        let data = EncryptedData {
            nonce: [0u8; NONCE_SIZE],
            ciphertext: vec![1, 2, 3],
        };
        assert!(matches!(decrypt(&key, &data), Err(CryptoError::Decryption(_))));
    }
}
