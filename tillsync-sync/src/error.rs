//! Sync error types.

use thiserror::Error;
use tillsync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while queueing or delivering mutations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No API key stored; nothing can be sent.
    #[error("authentication required")]
    AuthRequired,

    #[error("device is offline")]
    Offline,

    #[error("sync coordinator not running")]
    ChannelClosed,

    #[error("mutation {uuid} dropped after {retries} failed attempts")]
    MaxRetriesExceeded { uuid: String, retries: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// True for failures that leave the item queued for the next drain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Http(_) | SyncError::Api { .. })
    }
}
