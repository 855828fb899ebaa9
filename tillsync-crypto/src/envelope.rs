//! Record envelopes: encrypted payload plus plaintext index fields.
//!
//! The envelope is what the store persists. `plaintext_index_fields`
//! duplicates the subset of the record needed by the collection's declared
//! indices, since index lookups cannot see inside the ciphertext.
//!
//! Values that are not envelopes (records written before encryption was
//! introduced) pass through [`decrypt_record`] unchanged.

use crate::cipher::{decrypt, encrypt, EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker field identifying a stored value as an envelope.
pub const ENVELOPE_MARKER: &str = "_encrypted";

/// An encrypted record as stored at rest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EncryptedEnvelope {
    #[serde(rename = "_encrypted")]
    pub marker: bool,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(default)]
    pub plaintext_index_fields: Map<String, Value>,
}

impl EncryptedEnvelope {
    /// Reads a duplicated index field without decrypting.
    pub fn index_field(&self, name: &str) -> Option<&Value> {
        self.plaintext_index_fields.get(name)
    }

    pub fn to_value(&self) -> CryptoResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses a stored value as an envelope, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !is_envelope(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Returns true if `value` carries the envelope marker.
pub fn is_envelope(value: &Value) -> bool {
    value
        .get(ENVELOPE_MARKER)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Seals `record`, duplicating each field of `preserve_fields` that the record
/// has into the envelope's plaintext index map.
pub fn encrypt_record(
    key: &DerivedKey,
    record: &Value,
    preserve_fields: &[&str],
) -> CryptoResult<EncryptedEnvelope> {
    let plaintext = serde_json::to_vec(record)?;
    let sealed = encrypt(key, &plaintext)?;

    let mut plaintext_index_fields = Map::new();
    if let Some(obj) = record.as_object() {
        for field in preserve_fields {
            if let Some(v) = obj.get(*field) {
                plaintext_index_fields.insert((*field).to_string(), v.clone());
            }
        }
    }

    Ok(EncryptedEnvelope {
        marker: true,
        iv: sealed.nonce.to_vec(),
        ciphertext: sealed.ciphertext,
        plaintext_index_fields,
    })
}

/// Opens a stored value. Non-envelope values are returned unchanged.
pub fn decrypt_record(key: &DerivedKey, stored: Value) -> CryptoResult<Value> {
    if !is_envelope(&stored) {
        return Ok(stored);
    }

    let envelope: EncryptedEnvelope = serde_json::from_value(stored)
        .map_err(|e| CryptoError::Decryption(format!("malformed envelope: {e}")))?;
    open_envelope(key, &envelope)
}

/// Decrypts an envelope back into the original record.
pub fn open_envelope(key: &DerivedKey, envelope: &EncryptedEnvelope) -> CryptoResult<Value> {
    let nonce: [u8; NONCE_SIZE] = envelope.iv.as_slice().try_into().map_err(|_| {
        CryptoError::Decryption(format!(
            "iv must be {NONCE_SIZE} bytes, got {}",
            envelope.iv.len()
        ))
    })?;

    let plaintext = decrypt(
        key,
        &EncryptedData {
            nonce,
            ciphertext: envelope.ciphertext.clone(),
        },
    )?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::Decryption(format!("payload is not a record: {e}")))
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
