//! Shared helpers for sync integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tillsync_crypto::{generate_random_key, KeyedEncryptor};
use tillsync_storage::LocalStore;
use tillsync_sync::coordinator::SyncCoordinator;
use tillsync_sync::session::SessionStore;
use tillsync_sync::{SyncConfig, SyncEvent};
use tokio::sync::broadcast;
use wiremock::MockServer;

pub const API_KEY: &str = "pos-api-key-1";
pub const CSRF_TOKEN: &str = "csrf-token-1";

/// In-memory store sealing records with a fresh key.
pub fn encrypted_store() -> LocalStore {
    let enc = Arc::new(KeyedEncryptor::with_key(generate_random_key()));
    LocalStore::open_in_memory_with_encryptor(enc).unwrap()
}

pub fn test_config(server: &MockServer) -> SyncConfig {
    SyncConfig {
        api_base_url: server.uri(),
        online_debounce_ms: 50,
        request_timeout_secs: 5,
        signal_poll_interval_secs: 1,
        ..SyncConfig::default()
    }
}

pub fn store_credentials(store: &LocalStore) {
    let session = SessionStore::new(store.clone());
    session.store_api_key(API_KEY).unwrap();
    session.store_csrf_token(CSRF_TOKEN).unwrap();
}

/// Online coordinator with credentials already stored.
pub fn online_coordinator(server: &MockServer, store: LocalStore) -> SyncCoordinator {
    store_credentials(&store);
    let coordinator = SyncCoordinator::new(store, test_config(server)).unwrap();
    coordinator.set_online(true);
    coordinator
}

pub fn sale(total: &str) -> Value {
    json!({
        "id": "temp_1",
        "branch_id": 3,
        "total": total,
        "lines": [{ "product_id": 1, "qty": 2 }],
    })
}

/// Drains every event currently buffered on `rx`.
pub fn buffered_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Waits for the first event matching `pred`, failing after a few seconds.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}
