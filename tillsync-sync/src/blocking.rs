//! Runs store calls off the async executor.
//!
//! `LocalStore` is synchronous and may wait on SQLite's busy timeout while
//! another process holds the write lock, so async paths hand every store
//! call to the blocking pool.

use crate::error::SyncResult;

pub(crate) async fn run_blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
