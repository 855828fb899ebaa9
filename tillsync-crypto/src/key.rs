//! Device key material.

use crate::error::{CryptoError, CryptoResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

const KEY_TYPE: &str = "oct";
const KEY_ALG: &str = "C20P";

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Exports the key in its portable, serializable form.
    pub fn export(&self) -> ExportedKey {
        ExportedKey {
            kty: KEY_TYPE.to_string(),
            alg: KEY_ALG.to_string(),
            k: URL_SAFE_NO_PAD.encode(self.0),
            created_at: Utc::now(),
        }
    }

    /// Imports a key previously produced by [`DerivedKey::export`].
    pub fn import(exported: &ExportedKey) -> CryptoResult<Self> {
        if exported.kty != KEY_TYPE {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key type `{}`",
                exported.kty
            )));
        }
        if exported.alg != KEY_ALG {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported algorithm `{}`",
                exported.alg
            )));
        }

        let mut raw = URL_SAFE_NO_PAD
            .decode(exported.k.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(format!("base64 decode: {e}")))?;
        if raw.len() != KEY_SIZE {
            let actual = raw.len();
            raw.zeroize();
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual,
            });
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// JWK-style export of a [`DerivedKey`], stored in the `settings` collection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedKey {
    pub kty: String,
    pub alg: String,
    /// Base64url key bytes, no padding.
    pub k: String,
    pub created_at: DateTime<Utc>,
}

/// Generates a fresh random key.
pub fn generate_random_key() -> DerivedKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    DerivedKey(bytes)
}
