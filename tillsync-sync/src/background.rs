//! Background sync driver.
//!
//! Runs one drain from a context that may have no live POS instance: a
//! scheduled job, a service worker host, or the `tillsync-background`
//! binary. It opens its own store, loads the device key and credentials from
//! it, drains, and tells every registered [`CompletionNotifier`] how many
//! mutations went out.

use crate::api_client::OfflineApiClient;
use crate::blocking::run_blocking;
use crate::config::SyncConfig;
use crate::drain::drain_outbox;
use crate::error::SyncResult;
use crate::outbox::MutationOutbox;
use crate::session::SessionStore;
use crate::types::{DrainReport, SyncSignal};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tillsync_storage::names::SYNC_SIGNALS;
use tillsync_storage::LocalStore;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Receives the completion signal after a background drain.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, signal: &SyncSignal) -> SyncResult<()>;
}

/// Leaves the signal in the shared store for live coordinators to pick up.
#[derive(Clone)]
pub struct SignalBoard {
    store: LocalStore,
}

impl SignalBoard {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CompletionNotifier for SignalBoard {
    async fn notify(&self, signal: &SyncSignal) -> SyncResult<()> {
        let record = json!({
            "id": Uuid::now_v7().to_string(),
            "type": signal.kind,
            "count": signal.count,
            "created_at": Utc::now(),
        });
        let store = self.store.clone();
        run_blocking(move || Ok(store.put(SYNC_SIGNALS, &record)?)).await
    }
}

/// Publishes the signal on an in-process broadcast channel.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<SyncSignal>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncSignal> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl CompletionNotifier for ChannelNotifier {
    async fn notify(&self, signal: &SyncSignal) -> SyncResult<()> {
        // Nobody listening is not an error.
        let _ = self.tx.send(signal.clone());
        Ok(())
    }
}

pub struct BackgroundSync {
    config: SyncConfig,
    notifiers: Vec<Arc<dyn CompletionNotifier>>,
}

impl BackgroundSync {
    pub fn new(config: SyncConfig, notifiers: Vec<Arc<dyn CompletionNotifier>>) -> Self {
        Self { config, notifiers }
    }

    /// Opens the encrypted store at `db_path` and runs one pass.
    ///
    /// The completion signal also goes to that store's [`SignalBoard`].
    pub async fn run_once(&self, db_path: &Path) -> SyncResult<DrainReport> {
        let path = db_path.to_path_buf();
        let store = run_blocking(move || Ok(LocalStore::open_secure(&path)?)).await?;
        let board = SignalBoard::new(store.clone());
        self.run(&store, Some(&board)).await
    }

    /// Runs one pass against an already-open store.
    pub async fn run_with_store(&self, store: &LocalStore) -> SyncResult<DrainReport> {
        self.run(store, None).await
    }

    async fn run(
        &self,
        store: &LocalStore,
        board: Option<&SignalBoard>,
    ) -> SyncResult<DrainReport> {
        self.config.validate()?;

        let session = SessionStore::new(store.clone());
        let creds = run_blocking(move || session.load()).await?;
        creds.require_api_key()?;

        let outbox = MutationOutbox::with_max_retries(store.clone(), self.config.max_retries);
        let api = OfflineApiClient::new(&self.config)?;
        let report = drain_outbox(&outbox, &api, &creds, None).await?;

        info!(
            "background sync: {} delivered, {} failed, {} dropped",
            report.succeeded,
            report.failed,
            report.dropped.len()
        );

        let signal = SyncSignal::complete(report.succeeded);
        if let Some(board) = board {
            if let Err(e) = board.notify(&signal).await {
                warn!("failed to post completion signal: {e}");
            }
        }
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&signal).await {
                warn!("completion notifier failed: {e}");
            }
        }

        Ok(report)
    }
}
