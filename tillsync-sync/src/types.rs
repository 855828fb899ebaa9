//! Shared types for queueing and sync operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use uuid::Uuid;

/// Delivery state of a queued mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Pending,
    /// A send was started. Still counts as pending if the process dies.
    InFlight,
}

/// A locally recorded mutation awaiting delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Client-generated idempotency key; the server dedups on it.
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: QueueStatus,
    #[serde(default)]
    pub retries: u32,
}

impl QueueItem {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            kind: kind.into(),
            data,
            created_at: Utc::now(),
            status: QueueStatus::Pending,
            retries: 0,
        }
    }

    /// The request body sent to the server.
    pub fn to_request(&self) -> MutationRequest<'_> {
        MutationRequest {
            uuid: self.uuid,
            kind: &self.kind,
            data: &self.data,
        }
    }
}

/// Wire body of `POST offline/transaction/`.
#[derive(Debug, Serialize)]
pub struct MutationRequest<'a> {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data: &'a Value,
}

/// One entry of the inventory delta feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub id: Value,
    pub stock_quantity: Number,
}

/// Type tag of the background completion signal.
pub const SYNC_COMPLETE: &str = "SYNC_COMPLETE";

/// Cross-context notice that a background drain finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSignal {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: usize,
}

impl SyncSignal {
    pub fn complete(count: usize) -> Self {
        Self {
            kind: SYNC_COMPLETE.to_string(),
            count,
        }
    }
}

/// A mutation removed after exhausting its retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedMutation {
    pub uuid: Uuid,
    pub kind: String,
    pub retries: u32,
}

/// Outcome of one pass over the outbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items the server accepted (and that were removed).
    pub succeeded: usize,
    /// Items whose send failed this pass, dropped ones included.
    pub failed: usize,
    pub dropped: Vec<DroppedMutation>,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// What `purge` removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub mutations: usize,
    pub provisional_records: usize,
}

/// Notifications published by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Online,
    Offline,
    DrainStarted { pending: usize },
    DrainCompleted { succeeded: usize, failed: usize, dropped: usize },
    MutationDropped { uuid: Uuid, kind: String, retries: u32 },
    CacheRefreshed { collections: usize },
    InventorySynced { updated: usize },
    BackgroundSyncCompleted { count: usize },
}

/// Coordinator lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Offline,
    Idle,
    Draining,
}

/// Point-in-time view of the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: CoordinatorState,
    pub is_online: bool,
    pub pending_count: usize,
}

/// Commands accepted by the coordinator loop.
#[derive(Debug)]
pub enum CoordinatorCommand {
    SetOnline(bool),
    SyncNow,
    Stop,
}
