//! Sync configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the coordinator and the background driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL for the offline API (e.g., "https://pos.example.com/api/v1").
    pub api_base_url: String,

    /// Failed delivery attempts after which a mutation is dropped.
    pub max_retries: u32,

    /// Quiet period after connectivity returns before draining.
    pub online_debounce_ms: u64,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,

    /// How often a live coordinator checks for background completion signals.
    pub signal_poll_interval_secs: u64,

    /// Capacity of the sync event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            max_retries: 3,
            online_debounce_ms: 1000,
            request_timeout_secs: 30,
            signal_poll_interval_secs: 5,
            event_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Config pointing at a local test server.
    pub fn for_base_url(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.api_base_url.is_empty() {
            return Err(SyncError::Config("api_base_url is empty".into()));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn online_debounce(&self) -> Duration {
        Duration::from_millis(self.online_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_secs(self.signal_poll_interval_secs.max(1))
    }
}
