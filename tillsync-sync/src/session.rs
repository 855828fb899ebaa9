//! Session credentials kept in the settings collection.
//!
//! Both values are sealed like ordinary settings, so the background driver
//! can only read them after loading the device key.

use crate::error::{SyncError, SyncResult};
use serde_json::{json, Value};
use tillsync_storage::names::SETTINGS;
use tillsync_storage::LocalStore;
use tracing::debug;

pub const API_KEY_SETTING: &str = "api_key";
pub const CSRF_TOKEN_SETTING: &str = "csrf_token";

/// Credentials attached to every request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub api_key: Option<String>,
    pub csrf_token: Option<String>,
}

impl SessionCredentials {
    /// Returns the API key or [`SyncError::AuthRequired`].
    pub fn require_api_key(&self) -> SyncResult<&str> {
        self.api_key.as_deref().ok_or(SyncError::AuthRequired)
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct SessionStore {
    store: LocalStore,
}

impl SessionStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store_api_key(&self, api_key: &str) -> SyncResult<()> {
        self.put(API_KEY_SETTING, api_key)
    }

    pub fn store_csrf_token(&self, csrf_token: &str) -> SyncResult<()> {
        self.put(CSRF_TOKEN_SETTING, csrf_token)
    }

    pub fn load(&self) -> SyncResult<SessionCredentials> {
        let creds = SessionCredentials {
            api_key: self.read(API_KEY_SETTING)?,
            csrf_token: self.read(CSRF_TOKEN_SETTING)?,
        };
        debug!(
            "session loaded (api_key: {}, csrf_token: {})",
            creds.api_key.is_some(),
            creds.csrf_token.is_some()
        );
        Ok(creds)
    }

    /// Forgets both credentials.
    pub fn clear(&self) -> SyncResult<()> {
        self.store.delete(SETTINGS, &json!(API_KEY_SETTING))?;
        self.store.delete(SETTINGS, &json!(CSRF_TOKEN_SETTING))?;
        Ok(())
    }

    fn put(&self, key: &str, value: &str) -> SyncResult<()> {
        self.store
            .put(SETTINGS, &json!({ "key": key, "value": value }))?;
        Ok(())
    }

    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        let entry = self.store.get(SETTINGS, &json!(key))?;
        Ok(entry
            .as_ref()
            .and_then(|e| e.get("value"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}
