//! SQLite storage layer for tillsync.
//!
//! Provides the durable, versioned store the point-of-sale works against
//! while offline.
//!
//! # Architecture
//!
//! - Records are JSON documents grouped into named collections, each with a
//!   primary-key field and zero or more non-unique secondary indices
//! - Bodies are sealed through a [`tillsync_crypto::DataEncryptor`]; index
//!   values come from the plaintext record and are kept beside the body
//! - The schema is upgraded additively on open, inside one write transaction,
//!   so several processes may open the same file concurrently
//! - The device key is bootstrapped by [`keyring`] with compare-and-set

mod error;
pub mod keyring;
pub mod schema;
mod store;

pub use error::{StorageError, StorageResult};
pub use schema::{names, CollectionSchema, IndexSpec, SCHEMA_VERSION};
pub use store::LocalStore;
