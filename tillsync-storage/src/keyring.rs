//! Device key persistence.
//!
//! The key lives in the settings collection under [`KEY_SETTING`], written
//! raw (never sealed with itself). Creation is compare-and-set so two
//! contexts racing on first launch end up sharing whichever key landed first.

use crate::error::{StorageError, StorageResult};
use crate::schema::names::SETTINGS;
use crate::store::LocalStore;
use serde_json::{json, Value};
use tillsync_crypto::{generate_random_key, DerivedKey, ExportedKey, KeyedEncryptor};
use tracing::{debug, info};

/// Settings key holding the exported device key.
pub const KEY_SETTING: &str = "pos_secure_key";

/// Loads the persisted device key, if one exists.
pub fn load(store: &LocalStore) -> StorageResult<Option<DerivedKey>> {
    let Some(entry) = store.get_raw(SETTINGS, &json!(KEY_SETTING))? else {
        return Ok(None);
    };
    let value = entry
        .get("value")
        .cloned()
        .ok_or_else(|| StorageError::KeyMaterial("key setting has no value".into()))?;
    let exported: ExportedKey = serde_json::from_value(value)
        .map_err(|e| StorageError::KeyMaterial(e.to_string()))?;
    let key = DerivedKey::import(&exported).map_err(|e| StorageError::KeyMaterial(e.to_string()))?;
    Ok(Some(key))
}

/// Loads the device key into `encryptor`, generating and persisting one
/// first if the store has none.
pub fn bootstrap(store: &LocalStore, encryptor: &KeyedEncryptor) -> StorageResult<()> {
    if let Some(key) = load(store)? {
        debug!("loaded existing device key");
        encryptor.set_key(key);
        return Ok(());
    }

    let candidate = generate_random_key();
    let wrote = store.put_raw_if_absent(SETTINGS, &key_entry(&candidate.export()))?;
    if wrote {
        info!("generated new device key");
        encryptor.set_key(candidate);
        return Ok(());
    }

    // Another context won the race; adopt its key.
    let key = load(store)?
        .ok_or_else(|| StorageError::KeyMaterial("key vanished after concurrent create".into()))?;
    debug!("adopted device key created concurrently");
    encryptor.set_key(key);
    Ok(())
}

fn key_entry(exported: &ExportedKey) -> Value {
    json!({ "key": KEY_SETTING, "value": exported })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_crypto::DataEncryptor;

    #[test]
    fn bootstrap_is_stable_across_calls() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = KeyedEncryptor::new();
        bootstrap(&store, &first).unwrap();
        assert!(first.is_available());

        let second = KeyedEncryptor::new();
        bootstrap(&store, &second).unwrap();

        let key = load(&store).unwrap().unwrap();
        let sealed = first.seal(&json!({ "id": 1 }), &[]).unwrap();
        assert_eq!(second.open(sealed).unwrap(), json!({ "id": 1 }));
        assert_eq!(key.export().k.len(), 43);
    }

    #[test]
    fn corrupt_key_setting_is_reported() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .put_raw(SETTINGS, &json!({ "key": KEY_SETTING, "value": { "kty": "oct" } }))
            .unwrap();
        assert!(matches!(load(&store), Err(StorageError::KeyMaterial(_))));
    }
}
