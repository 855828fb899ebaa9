//! Durable queue of mutations awaiting delivery.
//!
//! Items live in the `outbox` collection and are sealed like any other
//! record. An item is removed only after the server acknowledges it, or when
//! its retry count reaches the ceiling. The ceiling is the one place this
//! subsystem deliberately discards data.

use crate::error::{SyncError, SyncResult};
use crate::types::{PurgeReport, QueueItem, QueueStatus};
use serde_json::{json, Value};
use tillsync_storage::names::{OUTBOX, PURCHASE_ORDERS, STOCK_TRANSFERS};
use tillsync_storage::LocalStore;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default number of failed attempts before an item is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Status given to records created offline that the server has not seen yet.
const PENDING_SYNC_STATUS: &str = "pending_sync";
/// Prefix of provisional ids minted on the device.
const TEMP_ID_PREFIX: &str = "temp_";

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Still queued; will be retried on the next drain.
    Requeued(QueueItem),
    /// Retry ceiling reached; the item has been removed.
    Dropped(QueueItem),
    /// Another context removed the item meanwhile.
    AlreadyRemoved,
}

/// Outbox over the shared store.
#[derive(Clone)]
pub struct MutationOutbox {
    store: LocalStore,
    max_retries: u32,
}

impl MutationOutbox {
    pub fn new(store: LocalStore) -> Self {
        Self::with_max_retries(store, DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(store: LocalStore, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Records a mutation and returns its idempotency key.
    pub fn enqueue(&self, kind: &str, data: Value) -> SyncResult<Uuid> {
        let item = QueueItem::new(kind, data);
        self.store.insert(OUTBOX, &serde_json::to_value(&item)?)?;
        debug!("queued {kind} mutation {}", item.uuid);
        Ok(item.uuid)
    }

    /// The whole backlog, oldest first.
    pub fn all(&self) -> SyncResult<Vec<QueueItem>> {
        let mut items: Vec<QueueItem> = self
            .store
            .get_all(OUTBOX)?
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("skipping malformed outbox item: {e}");
                    None
                }
            })
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(items)
    }

    pub fn get(&self, uuid: Uuid) -> SyncResult<Option<QueueItem>> {
        match self.store.get(OUTBOX, &key(uuid))? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.store.count(OUTBOX)?)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes an acknowledged item. Returns false if it was already gone.
    pub fn remove(&self, uuid: Uuid) -> SyncResult<bool> {
        Ok(self.store.delete(OUTBOX, &key(uuid))?)
    }

    /// Persists the in-flight marker before a send.
    ///
    /// Returns false, writing nothing, if the item is no longer queued.
    pub fn mark_in_flight(&self, item: &mut QueueItem) -> SyncResult<bool> {
        item.status = QueueStatus::InFlight;
        Ok(self.store.update(OUTBOX, &serde_json::to_value(&*item)?)?)
    }

    /// Records a failed attempt: bumps `retries`, and removes the item once
    /// the ceiling is reached.
    pub fn bump_retry(&self, item: QueueItem) -> SyncResult<RetryOutcome> {
        // Re-read so retries counted by another context are kept.
        let Some(stored) = self.get(item.uuid)? else {
            return Ok(RetryOutcome::AlreadyRemoved);
        };

        let mut item = item;
        item.retries = item.retries.max(stored.retries) + 1;
        item.status = QueueStatus::Pending;

        if item.retries >= self.max_retries {
            self.remove(item.uuid)?;
            let err = SyncError::MaxRetriesExceeded {
                uuid: item.uuid.to_string(),
                retries: item.retries,
            };
            error!("{} mutation dropped: {err}", item.kind);
            return Ok(RetryOutcome::Dropped(item));
        }

        if !self.store.update(OUTBOX, &serde_json::to_value(&item)?)? {
            return Ok(RetryOutcome::AlreadyRemoved);
        }
        debug!("mutation {} requeued (retries={})", item.uuid, item.retries);
        Ok(RetryOutcome::Requeued(item))
    }

    /// Empties the queue and deletes the provisional records queued
    /// mutations created.
    pub fn purge(&self) -> SyncResult<PurgeReport> {
        let mutations = self.len()?;
        self.store.clear(OUTBOX)?;

        let mut provisional_records = 0;
        for collection in [STOCK_TRANSFERS, PURCHASE_ORDERS] {
            for record in self.store.get_all(collection)? {
                if !is_provisional(&record) {
                    continue;
                }
                if let Some(id) = record.get("id") {
                    if self.store.delete(collection, id)? {
                        provisional_records += 1;
                    }
                }
            }
        }

        warn!("purged {mutations} queued mutations and {provisional_records} provisional records");
        Ok(PurgeReport {
            mutations,
            provisional_records,
        })
    }
}

fn key(uuid: Uuid) -> Value {
    json!(uuid.to_string())
}

fn is_provisional(record: &Value) -> bool {
    let pending = record.get("status").and_then(Value::as_str) == Some(PENDING_SYNC_STATUS);
    let temp_id = record
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| id.starts_with(TEMP_ID_PREFIX));
    pending || temp_id
}
