//! At-rest encryption layer for tillsync.
//!
//! Provides record-level encryption for the offline store using:
//! - ChaCha20-Poly1305 for authenticated encryption
//! - A single random device key, exported as a portable JWK-like object
//! - Envelopes that keep a whitelisted subset of fields in plaintext
//!
//! # Architecture
//!
//! The store never sees key bytes. It talks to a [`DataEncryptor`], which
//! either passes records through untouched ([`PassthroughEncryptor`]) or
//! seals them into an [`EncryptedEnvelope`] with the device key
//! ([`KeyedEncryptor`]).
//!
//! Index fields are duplicated in plaintext on the envelope so that
//! secondary indices keep working. They are never treated as authoritative:
//! decryption always returns the sealed payload.

mod cipher;
pub mod encryptor;
pub mod envelope;
mod error;
mod key;

pub use cipher::{decrypt, encrypt, EncryptedData, NONCE_SIZE, TAG_SIZE};
pub use encryptor::{DataEncryptor, KeyedEncryptor, PassthroughEncryptor};
pub use envelope::{
    decrypt_record, encrypt_record, is_envelope, open_envelope, EncryptedEnvelope,
    ENVELOPE_MARKER,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{generate_random_key, DerivedKey, ExportedKey, KEY_SIZE};
