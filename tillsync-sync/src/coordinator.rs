//! Sync coordinator for a running POS instance.
//!
//! [`SyncCoordinator`] is the service object: it queues mutations, drains
//! the outbox, refreshes cached reference data and publishes [`SyncEvent`]s.
//! [`SyncLoop`] is the event loop that reacts to connectivity changes:
//! - Connectivity regained: debounce, then drain
//! - Connectivity lost: cancel any pending debounce
//! - Periodic check for completion signals left by the background driver
//!
//! Follows the handle + loop shape of the cloud sync engine: commands go in
//! over an mpsc channel, the loop owns the timers.

use crate::api_client::{OfflineApiClient, Snapshot};
use crate::blocking::run_blocking;
use crate::config::SyncConfig;
use crate::drain::drain_outbox;
use crate::error::{SyncError, SyncResult};
use crate::outbox::MutationOutbox;
use crate::session::{SessionCredentials, SessionStore};
use crate::types::*;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tillsync_storage::names::{OUTBOX, PRODUCTS, SETTINGS, SYNC_SIGNALS};
use tillsync_storage::{keyring, schema, LocalStore};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tag used when asking the platform to schedule a background sync.
pub const BACKGROUND_SYNC_TAG: &str = "sync-transactions";

/// Collections a snapshot may never overwrite.
const LOCAL_ONLY_COLLECTIONS: &[&str] = &[OUTBOX, SYNC_SIGNALS];

/// Schedules the background driver with the host platform.
#[async_trait]
pub trait BackgroundRegistrar: Send + Sync {
    async fn register(&self, tag: &str) -> SyncResult<()>;
}

struct Inner {
    store: LocalStore,
    outbox: MutationOutbox,
    session: SessionStore,
    api: OfflineApiClient,
    config: SyncConfig,
    online: AtomicBool,
    draining: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    registrar: RwLock<Option<Arc<dyn BackgroundRegistrar>>>,
}

/// Coordinates delivery and cache refresh for one POS instance.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

/// Clears the draining flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    /// Creates a coordinator over `store`. Starts offline.
    pub fn new(store: LocalStore, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let api = OfflineApiClient::new(&config)?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                outbox: MutationOutbox::with_max_retries(store.clone(), config.max_retries),
                session: SessionStore::new(store.clone()),
                store,
                api,
                config,
                online: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                events,
                registrar: RwLock::new(None),
            }),
        })
    }

    pub fn set_registrar(&self, registrar: Arc<dyn BackgroundRegistrar>) {
        match self.inner.registrar.write() {
            Ok(mut guard) => *guard = Some(registrar),
            Err(poisoned) => *poisoned.into_inner() = Some(registrar),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn outbox(&self) -> &MutationOutbox {
        &self.inner.outbox
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Records a connectivity change. Does not drain by itself; the run loop
    /// debounces and drains.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if was != online {
            info!("connectivity {}", if online { "regained" } else { "lost" });
            self.emit(if online { SyncEvent::Online } else { SyncEvent::Offline });
        }
    }

    /// Persists the session credentials used for every request.
    pub fn store_credentials(&self, api_key: &str, csrf_token: Option<&str>) -> SyncResult<()> {
        self.inner.session.store_api_key(api_key)?;
        if let Some(token) = csrf_token {
            self.inner.session.store_csrf_token(token)?;
        }
        Ok(())
    }

    pub fn status(&self) -> SyncResult<SyncStatus> {
        let is_online = self.is_online();
        let state = if self.inner.draining.load(Ordering::Acquire) {
            CoordinatorState::Draining
        } else if is_online {
            CoordinatorState::Idle
        } else {
            CoordinatorState::Offline
        };
        Ok(SyncStatus {
            state,
            is_online,
            pending_count: self.inner.outbox.len()?,
        })
    }

    /// Drains the outbox once.
    ///
    /// Returns `Ok(None)` without touching the network if a drain is
    /// already running in this process.
    pub async fn sync_all(&self) -> SyncResult<Option<DrainReport>> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain already in progress, skipping");
            return Ok(None);
        }
        let _guard = DrainGuard(&self.inner.draining);

        let creds = self.load_credentials().await?;
        creds.require_api_key()?;

        let outbox = self.inner.outbox.clone();
        let pending = run_blocking(move || outbox.len()).await?;
        self.emit(SyncEvent::DrainStarted { pending });

        let report = drain_outbox(
            &self.inner.outbox,
            &self.inner.api,
            &creds,
            Some(&self.inner.events),
        )
        .await?;

        if report.attempted() > 0 {
            info!(
                "drain complete: {} delivered, {} failed, {} dropped",
                report.succeeded,
                report.failed,
                report.dropped.len()
            );
        }
        self.emit(SyncEvent::DrainCompleted {
            succeeded: report.succeeded,
            failed: report.failed,
            dropped: report.dropped.len(),
        });
        Ok(Some(report))
    }

    /// Queues a mutation, then schedules delivery if online.
    ///
    /// Delivery failures are logged, not returned: once queued the mutation
    /// is safe and will go out on a later drain.
    pub async fn queue_mutation(&self, kind: &str, data: Value) -> SyncResult<Uuid> {
        let outbox = self.inner.outbox.clone();
        let kind = kind.to_string();
        let uuid = run_blocking(move || outbox.enqueue(&kind, data)).await?;
        if !self.is_online() {
            return Ok(uuid);
        }

        let registrar = match self.inner.registrar.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(registrar) = registrar {
            match registrar.register(BACKGROUND_SYNC_TAG).await {
                Ok(()) => return Ok(uuid),
                Err(e) => warn!("background sync registration failed, draining now: {e}"),
            }
        }

        if let Err(e) = self.sync_all().await {
            warn!("immediate drain after queueing failed: {e}");
        }
        Ok(uuid)
    }

    /// Refreshes cached reference data from a server snapshot.
    ///
    /// Array-valued collections are replaced wholesale. Settings are merged
    /// so key material and credentials survive. Unknown keys are ignored.
    pub async fn fetch_and_cache(&self, scope: &str) -> SyncResult<usize> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let creds = self.load_credentials().await?;
        let snapshot = self.inner.api.fetch_snapshot(scope, &creds).await?;

        let this = self.clone();
        let refreshed = run_blocking(move || this.cache_snapshot(snapshot)).await?;

        info!("reference data refreshed for {scope} ({refreshed} collections)");
        self.emit(SyncEvent::CacheRefreshed {
            collections: refreshed,
        });
        Ok(refreshed)
    }

    /// Applies server stock levels to cached products that exist locally.
    pub async fn sync_inventory(&self, scope: &str) -> SyncResult<usize> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let creds = self.load_credentials().await?;
        let updates = self.inner.api.fetch_inventory(scope, &creds).await?;

        let this = self.clone();
        let updated = run_blocking(move || this.apply_inventory(updates)).await?;

        debug!("inventory synced for {scope}: {updated} products");
        self.emit(SyncEvent::InventorySynced { updated });
        Ok(updated)
    }

    /// Consumes completion signals written by the background driver and
    /// re-publishes them as [`SyncEvent::BackgroundSyncCompleted`].
    pub fn poll_background_signals(&self) -> SyncResult<usize> {
        let mut consumed = 0;
        for record in self.inner.store.get_all(SYNC_SIGNALS)? {
            let Some(id) = record.get("id").cloned() else {
                continue;
            };
            // Whoever deletes the signal reports it.
            if !self.inner.store.delete(SYNC_SIGNALS, &id)? {
                continue;
            }
            match serde_json::from_value::<SyncSignal>(record) {
                Ok(signal) if signal.kind == SYNC_COMPLETE => {
                    info!("background sync delivered {} mutations", signal.count);
                    self.emit(SyncEvent::BackgroundSyncCompleted {
                        count: signal.count,
                    });
                    consumed += 1;
                }
                Ok(signal) => debug!("ignoring signal {}", signal.kind),
                Err(e) => warn!("malformed sync signal: {e}"),
            }
        }
        Ok(consumed)
    }

    async fn load_credentials(&self) -> SyncResult<SessionCredentials> {
        let session = self.inner.session.clone();
        run_blocking(move || session.load()).await
    }

    /// Writes a snapshot into the cache. Array-valued collections are
    /// replaced wholesale; settings are merged.
    fn cache_snapshot(&self, snapshot: Snapshot) -> SyncResult<usize> {
        let mut refreshed = 0;
        for (name, value) in snapshot {
            if name == SETTINGS {
                self.merge_settings(&value)?;
                refreshed += 1;
                continue;
            }
            if schema::find(&name).is_none() || LOCAL_ONLY_COLLECTIONS.contains(&name.as_str()) {
                debug!("ignoring snapshot key {name}");
                continue;
            }
            let Value::Array(records) = value else {
                warn!("snapshot entry {name} is not an array, skipping");
                continue;
            };
            self.inner.store.replace_all(&name, &records)?;
            debug!("cached {} {name}", records.len());
            refreshed += 1;
        }
        Ok(refreshed)
    }

    fn apply_inventory(&self, updates: Vec<InventoryUpdate>) -> SyncResult<usize> {
        let mut patched = Vec::new();
        for update in updates {
            let Some(mut product) = self.inner.store.get(PRODUCTS, &update.id)? else {
                continue;
            };
            if let Some(obj) = product.as_object_mut() {
                obj.insert("stock_quantity".into(), Value::Number(update.stock_quantity));
                patched.push(product);
            }
        }
        self.inner.store.bulk_put(PRODUCTS, &patched)?;
        Ok(patched.len())
    }

    fn merge_settings(&self, value: &Value) -> SyncResult<()> {
        let Some(map) = value.as_object() else {
            warn!("snapshot settings is not an object, skipping");
            return Ok(());
        };
        let entries: Vec<Value> = map
            .iter()
            .filter(|(k, _)| k.as_str() != keyring::KEY_SETTING)
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();
        self.inner.store.bulk_put(SETTINGS, &entries)?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Handle for sending commands to the sync loop.
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    pub async fn set_online(&self, online: bool) -> SyncResult<()> {
        self.send(CoordinatorCommand::SetOnline(online)).await
    }

    pub async fn sync_now(&self) -> SyncResult<()> {
        self.send(CoordinatorCommand::SyncNow).await
    }

    pub async fn stop(&self) -> SyncResult<()> {
        self.send(CoordinatorCommand::Stop).await
    }

    async fn send(&self, cmd: CoordinatorCommand) -> SyncResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Event loop driving a [`SyncCoordinator`].
pub struct SyncLoop {
    coordinator: SyncCoordinator,
    command_rx: mpsc::Receiver<CoordinatorCommand>,
}

/// Creates the command handle and loop for a coordinator.
pub fn create_sync_loop(coordinator: SyncCoordinator) -> (CoordinatorHandle, SyncLoop) {
    let (command_tx, command_rx) = mpsc::channel(64);
    (
        CoordinatorHandle { command_tx },
        SyncLoop {
            coordinator,
            command_rx,
        },
    )
}

impl SyncLoop {
    /// Runs until stopped or every handle is dropped.
    pub async fn run(mut self) {
        info!("sync coordinator started");

        let debounce = self.coordinator.config().online_debounce();
        let poll_every = self.coordinator.config().signal_poll_interval();
        let mut signal_poll = tokio::time::interval(poll_every);
        signal_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        signal_poll.tick().await;

        let mut drain_at: Option<Instant> = None;

        loop {
            let deadline = drain_at.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if drain_at.is_some() => {
                    drain_at = None;
                    self.spawn_drain();
                }
                _ = signal_poll.tick() => {
                    let coordinator = self.coordinator.clone();
                    let polled = run_blocking(move || coordinator.poll_background_signals()).await;
                    if let Err(e) = polled {
                        warn!("signal poll failed: {e}");
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(CoordinatorCommand::SetOnline(true)) => {
                            self.coordinator.set_online(true);
                            // Each online event restarts the quiet period.
                            drain_at = Some(Instant::now() + debounce);
                        }
                        Some(CoordinatorCommand::SetOnline(false)) => {
                            self.coordinator.set_online(false);
                            drain_at = None;
                        }
                        Some(CoordinatorCommand::SyncNow) => self.spawn_drain(),
                        Some(CoordinatorCommand::Stop) => {
                            info!("sync coordinator stopping");
                            break;
                        }
                        None => {
                            info!("command channel closed, stopping sync coordinator");
                            break;
                        }
                    }
                }
            }
        }

        info!("sync coordinator stopped");
    }

    fn spawn_drain(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.sync_all().await {
                Ok(_) => {}
                Err(SyncError::Offline) => debug!("drain skipped: offline"),
                Err(e) => error!("drain failed: {e}"),
            }
        });
    }
}
