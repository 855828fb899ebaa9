//! One delivery pass over the outbox, shared by the coordinator and the
//! background driver.

use crate::api_client::OfflineApiClient;
use crate::blocking::run_blocking;
use crate::error::SyncResult;
use crate::outbox::{MutationOutbox, RetryOutcome};
use crate::session::SessionCredentials;
use crate::types::{DrainReport, DroppedMutation, QueueItem, SyncEvent};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// What happened to one item during a pass.
enum Delivery {
    Sent,
    /// Removed or already marked by another context.
    Skipped,
    /// Send failed; carries the item if the retry ceiling dropped it.
    Failed(Option<QueueItem>),
}

/// Attempts delivery of every queued item, oldest first.
///
/// A failed item is bumped and left for the next pass; it never stops the
/// rest of the pass. That includes local store failures on a single item,
/// which count as a failed attempt. There is no lock shared with other
/// processes: the coordinator and the background driver may both send the
/// same item, and the server's dedup on `uuid` is what keeps that harmless.
/// Items removed by another context mid-pass are skipped, never re-created.
pub async fn drain_outbox(
    outbox: &MutationOutbox,
    api: &OfflineApiClient,
    creds: &SessionCredentials,
    events: Option<&broadcast::Sender<SyncEvent>>,
) -> SyncResult<DrainReport> {
    let mut report = DrainReport::default();

    let backlog = outbox.clone();
    let items = run_blocking(move || backlog.all()).await?;

    for item in items {
        let uuid = item.uuid;
        match deliver(outbox, api, creds, item).await {
            Ok(Delivery::Sent) => report.succeeded += 1,
            Ok(Delivery::Skipped) => {}
            Ok(Delivery::Failed(None)) => report.failed += 1,
            Ok(Delivery::Failed(Some(dropped))) => {
                report.failed += 1;
                if let Some(tx) = events {
                    let _ = tx.send(SyncEvent::MutationDropped {
                        uuid: dropped.uuid,
                        kind: dropped.kind.clone(),
                        retries: dropped.retries,
                    });
                }
                report.dropped.push(DroppedMutation {
                    uuid: dropped.uuid,
                    kind: dropped.kind,
                    retries: dropped.retries,
                });
            }
            Err(e) => {
                warn!("mutation {uuid} left queued after local store error: {e}");
                report.failed += 1;
            }
        }
    }

    debug!(
        "drain finished: {} delivered, {} failed, {} dropped",
        report.succeeded,
        report.failed,
        report.dropped.len()
    );
    Ok(report)
}

async fn deliver(
    outbox: &MutationOutbox,
    api: &OfflineApiClient,
    creds: &SessionCredentials,
    mut item: QueueItem,
) -> SyncResult<Delivery> {
    let marker = outbox.clone();
    let (marked, item) = run_blocking(move || {
        let marked = marker.mark_in_flight(&mut item)?;
        Ok((marked, item))
    })
    .await?;
    if !marked {
        debug!("mutation {} already delivered elsewhere", item.uuid);
        return Ok(Delivery::Skipped);
    }

    let sent = api.post_mutation(&item.to_request(), creds).await;
    let outbox = outbox.clone();
    match sent {
        Ok(()) => {
            let uuid = item.uuid;
            run_blocking(move || outbox.remove(uuid)).await?;
            Ok(Delivery::Sent)
        }
        Err(e) => {
            if e.is_retryable() {
                warn!("delivery of {} mutation {} failed: {e}", item.kind, item.uuid);
            } else {
                error!("{} mutation {} hit a non-retryable error: {e}", item.kind, item.uuid);
            }
            match run_blocking(move || outbox.bump_retry(item)).await? {
                RetryOutcome::Dropped(dropped) => Ok(Delivery::Failed(Some(dropped))),
                RetryOutcome::Requeued(_) | RetryOutcome::AlreadyRemoved => {
                    Ok(Delivery::Failed(None))
                }
            }
        }
    }
}
