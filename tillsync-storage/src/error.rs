//! Storage error types.

use thiserror::Error;
use tillsync_crypto::CryptoError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the local store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The platform denied persistent storage. Fatal to the subsystem.
    #[error("persistent storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown index `{index}` on collection {collection}")]
    UnknownIndex { collection: String, index: String },

    #[error("record in {collection} is missing primary key field `{key_path}`")]
    MissingKey { collection: String, key_path: String },

    #[error("record already exists in {collection}: {key}")]
    Duplicate { collection: String, key: String },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub(crate) fn from_open(err: CryptoError) -> Self {
        StorageError::Decryption(err.to_string())
    }

    pub(crate) fn from_seal(err: CryptoError) -> Self {
        StorageError::Encryption(err.to_string())
    }

    /// True for per-record decryption failures that batch readers skip.
    pub fn is_decryption(&self) -> bool {
        matches!(self, StorageError::Decryption(_))
    }
}
