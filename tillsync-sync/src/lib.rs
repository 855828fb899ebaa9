//! Offline sync for tillsync.
//!
//! Delivers mutations recorded while offline and keeps cached reference data
//! fresh:
//! - Durable outbox with client-generated idempotency keys and bounded retries
//! - Coordinator that drains on reconnect (debounced) and on demand
//! - Background driver that drains without a live POS instance and signals
//!   completion back to running ones
//! - HTTP client for the offline API

pub mod api_client;
pub mod background;
mod blocking;
pub mod config;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod outbox;
pub mod session;
pub mod types;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use types::*;
