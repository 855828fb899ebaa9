use serde_json::json;
use tillsync_sync::api_client::OfflineApiClient;
use tillsync_sync::session::SessionCredentials;
use tillsync_sync::{QueueItem, SyncConfig, SyncError};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn setup(server: &MockServer) -> OfflineApiClient {
    OfflineApiClient::new(&SyncConfig::for_base_url(server.uri())).unwrap()
}

fn creds() -> SessionCredentials {
    SessionCredentials {
        api_key: Some("key-123".into()),
        csrf_token: Some("csrf-456".into()),
    }
}

// --- Mutations ---

#[tokio::test]
async fn post_mutation_sends_body_and_headers() {
    let server = MockServer::start().await;
    let item = QueueItem::new("sale", json!({ "total": "12.00" }));

    Mock::given(method("POST"))
        .and(path("/offline/transaction/"))
        .and(header("X-API-Key", "key-123"))
        .and(header("X-CSRFToken", "csrf-456"))
        .and(body_json(json!({
            "uuid": item.uuid.to_string(),
            "type": "sale",
            "data": { "total": "12.00" },
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    setup(&server)
        .post_mutation(&item.to_request(), &creds())
        .await
        .unwrap();
}

#[tokio::test]
async fn trailing_slash_in_base_url_is_tolerated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/offline/transaction/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client =
        OfflineApiClient::new(&SyncConfig::for_base_url(format!("{}/", server.uri()))).unwrap();
    let item = QueueItem::new("sale", json!({}));
    client.post_mutation(&item.to_request(), &creds()).await.unwrap();
}

#[tokio::test]
async fn non_success_status_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/offline/transaction/"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let item = QueueItem::new("sale", json!({}));
    let err = setup(&server)
        .post_mutation(&item.to_request(), &creds())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    match err {
        SyncError::Api { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_http_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let client = OfflineApiClient::new(&SyncConfig {
        request_timeout_secs: 2,
        ..SyncConfig::for_base_url(uri)
    })
    .unwrap();
    let item = QueueItem::new("sale", json!({}));
    let err = client
        .post_mutation(&item.to_request(), &creds())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Http(_)));
    assert!(err.is_retryable());
}

// --- Reference data ---

#[tokio::test]
async fn fetch_snapshot_by_scope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/offline/data/3/"))
        .and(header("X-API-Key", "key-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "products": [{ "id": 1, "name": "Coffee" }],
            "settings": { "currency": "GHS" },
        })))
        .mount(&server)
        .await;

    let snapshot = setup(&server).fetch_snapshot("3", &creds()).await.unwrap();
    assert_eq!(snapshot["products"][0]["name"], json!("Coffee"));
    assert_eq!(snapshot["settings"]["currency"], json!("GHS"));
}

#[tokio::test]
async fn fetch_inventory_parses_updates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/offline/inventory/3/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "stock_quantity": 4 },
            { "id": 2, "stock_quantity": 0.5 },
        ])))
        .mount(&server)
        .await;

    let updates = setup(&server).fetch_inventory("3", &creds()).await.unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].id, json!(1));
    assert_eq!(updates[1].stock_quantity.as_f64(), Some(0.5));
}

#[tokio::test]
async fn fetch_snapshot_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/offline/data/3/"))
        .respond_with(ResponseTemplate::new(403).set_body_string("bad key"))
        .mount(&server)
        .await;

    let err = setup(&server)
        .fetch_snapshot("3", &SessionCredentials::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Api { status: 403, .. }));
}
