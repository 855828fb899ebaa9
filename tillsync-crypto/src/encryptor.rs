//! The encryption seam between the store and the key.
//!
//! The store holds an `Arc<dyn DataEncryptor>` and never touches key bytes.
//! A [`KeyedEncryptor`] starts without a key and becomes available once the
//! key bootstrap installs one.

use crate::envelope::{decrypt_record, encrypt_record, is_envelope};
use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use serde_json::Value;
use std::sync::RwLock;

/// Seals and opens records for storage.
pub trait DataEncryptor: Send + Sync {
    /// Returns true when records written now will be encrypted.
    fn is_available(&self) -> bool;

    /// Produces the value to persist for `record`.
    fn seal(&self, record: &Value, preserve_fields: &[&str]) -> CryptoResult<Value>;

    /// Recovers the record from a persisted value. Legacy plaintext values
    /// are returned unchanged.
    fn open(&self, stored: Value) -> CryptoResult<Value>;
}

/// Stores records as-is. Used for tests and unencrypted installs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncryptor;

impl DataEncryptor for PassthroughEncryptor {
    fn is_available(&self) -> bool {
        true
    }

    fn seal(&self, record: &Value, _preserve_fields: &[&str]) -> CryptoResult<Value> {
        Ok(record.clone())
    }

    fn open(&self, stored: Value) -> CryptoResult<Value> {
        if is_envelope(&stored) {
            return Err(CryptoError::KeyUnavailable);
        }
        Ok(stored)
    }
}

/// Encrypts with the device key once one is installed.
#[derive(Default)]
pub struct KeyedEncryptor {
    key: RwLock<Option<DerivedKey>>,
}

impl KeyedEncryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: DerivedKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    /// Installs (or replaces) the key.
    pub fn set_key(&self, key: DerivedKey) {
        match self.key.write() {
            Ok(mut guard) => *guard = Some(key),
            Err(poisoned) => *poisoned.into_inner() = Some(key),
        }
    }

    fn with_loaded_key<T>(
        &self,
        f: impl FnOnce(&DerivedKey) -> CryptoResult<T>,
    ) -> CryptoResult<T> {
        let guard = self.key.read().map_err(|_| CryptoError::KeyUnavailable)?;
        match guard.as_ref() {
            Some(key) => f(key),
            None => Err(CryptoError::KeyUnavailable),
        }
    }
}

impl DataEncryptor for KeyedEncryptor {
    fn is_available(&self) -> bool {
        self.key.read().map(|k| k.is_some()).unwrap_or(false)
    }

    fn seal(&self, record: &Value, preserve_fields: &[&str]) -> CryptoResult<Value> {
        self.with_loaded_key(|key| encrypt_record(key, record, preserve_fields)?.to_value())
    }

    fn open(&self, stored: Value) -> CryptoResult<Value> {
        if !is_envelope(&stored) {
            return Ok(stored);
        }
        self.with_loaded_key(|key| decrypt_record(key, stored))
    }
}
