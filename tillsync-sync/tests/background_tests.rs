mod support;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tillsync_storage::names::SYNC_SIGNALS;
use tillsync_storage::LocalStore;
use tillsync_sync::background::{BackgroundSync, ChannelNotifier, CompletionNotifier};
use tillsync_sync::coordinator::SyncCoordinator;
use tillsync_sync::outbox::MutationOutbox;
use tillsync_sync::{SyncError, SyncEvent, SyncResult, SyncSignal};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::*;

struct FailingNotifier;

#[async_trait]
impl CompletionNotifier for FailingNotifier {
    async fn notify(&self, _signal: &SyncSignal) -> SyncResult<()> {
        Err(SyncError::Config("no clients".into()))
    }
}

fn seeded_store(dir: &tempfile::TempDir, items: usize) -> (std::path::PathBuf, LocalStore) {
    let path = dir.path().join("pos.db");
    let store = LocalStore::open_secure(&path).unwrap();
    store_credentials(&store);
    let outbox = MutationOutbox::new(store.clone());
    for i in 0..items {
        outbox.enqueue("sale", sale(&format!("{i}.50"))).unwrap();
    }
    (path, store)
}

#[tokio::test]
async fn run_once_drains_and_signals() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/offline/transaction/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (db, store) = seeded_store(&dir, 2);

    let channel = ChannelNotifier::new(4);
    let mut signals = channel.subscribe();
    let driver = BackgroundSync::new(test_config(&server), vec![Arc::new(channel)]);

    let report = driver.run_once(&db).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(signals.try_recv().unwrap(), SyncSignal::complete(2));

    assert!(MutationOutbox::new(store.clone()).is_empty().unwrap());
    assert_eq!(store.count(SYNC_SIGNALS).unwrap(), 1);
}

#[tokio::test]
async fn live_coordinator_sees_background_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (db, store) = seeded_store(&dir, 3);
    let coordinator = SyncCoordinator::new(store, test_config(&server)).unwrap();
    let mut events = coordinator.subscribe();

    BackgroundSync::new(test_config(&server), Vec::new())
        .run_once(&db)
        .await
        .unwrap();

    assert_eq!(coordinator.poll_background_signals().unwrap(), 1);
    assert_eq!(
        buffered_events(&mut events),
        vec![SyncEvent::BackgroundSyncCompleted { count: 3 }]
    );
}

#[tokio::test]
async fn missing_api_key_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pos.db");
    let store = LocalStore::open_secure(&db).unwrap();
    MutationOutbox::new(store.clone())
        .enqueue("sale", sale("1.00"))
        .unwrap();

    let channel = ChannelNotifier::new(4);
    let mut signals = channel.subscribe();
    let result = BackgroundSync::new(test_config(&server), vec![Arc::new(channel)])
        .run_once(&db)
        .await;

    assert!(matches!(result, Err(SyncError::AuthRequired)));
    assert!(signals.try_recv().is_err());
    assert_eq!(MutationOutbox::new(store).len().unwrap(), 1);
}

#[tokio::test]
async fn notifier_failure_does_not_fail_the_pass() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (_db, store) = seeded_store(&dir, 1);

    let channel = ChannelNotifier::new(4);
    let mut signals = channel.subscribe();
    let driver = BackgroundSync::new(
        test_config(&server),
        vec![Arc::new(FailingNotifier), Arc::new(channel)],
    );

    let report = driver.run_with_store(&store).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(signals.try_recv().unwrap().count, 1);
}

#[tokio::test]
async fn failures_are_counted_but_not_signalled_as_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (db, store) = seeded_store(&dir, 2);

    let channel = ChannelNotifier::new(4);
    let mut signals = channel.subscribe();
    let report = BackgroundSync::new(test_config(&server), vec![Arc::new(channel)])
        .run_once(&db)
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed), (0, 2));
    assert_eq!(signals.try_recv().unwrap(), SyncSignal::complete(0));
    assert!(MutationOutbox::new(store)
        .all()
        .unwrap()
        .iter()
        .all(|i| i.retries == 1));
}

#[tokio::test]
async fn coordinator_and_background_drain_together() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/offline/transaction/"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (db, store) = seeded_store(&dir, 5);
    let ids: HashSet<String> = MutationOutbox::new(store.clone())
        .all()
        .unwrap()
        .into_iter()
        .map(|i| i.uuid.to_string())
        .collect();

    let coordinator = SyncCoordinator::new(store.clone(), test_config(&server)).unwrap();
    coordinator.set_online(true);
    let driver = BackgroundSync::new(test_config(&server), Vec::new());

    let (live, background) = tokio::join!(coordinator.sync_all(), driver.run_once(&db));
    live.unwrap();
    background.unwrap();

    assert!(MutationOutbox::new(store).is_empty().unwrap());

    // Every item reached the server at least once; duplicates carry the same uuid.
    let sent: HashSet<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["uuid"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(sent, ids);
}
