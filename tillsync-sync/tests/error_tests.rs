use tillsync_storage::StorageError;
use tillsync_sync::SyncError;

#[test]
fn api_error_display() {
    let err = SyncError::Api {
        status: 503,
        body: "maintenance".into(),
    };
    assert_eq!(err.to_string(), "API request failed with status 503: maintenance");
    assert!(err.is_retryable());
}

#[test]
fn auth_required_display() {
    assert_eq!(SyncError::AuthRequired.to_string(), "authentication required");
    assert!(!SyncError::AuthRequired.is_retryable());
}

#[test]
fn max_retries_display() {
    let err = SyncError::MaxRetriesExceeded {
        uuid: "0190a8e4-0000-7000-8000-000000000000".into(),
        retries: 3,
    };
    assert_eq!(
        err.to_string(),
        "mutation 0190a8e4-0000-7000-8000-000000000000 dropped after 3 failed attempts"
    );
}

#[test]
fn storage_error_converts() {
    let err: SyncError = StorageError::Unavailable("quota exceeded".into()).into();
    assert!(matches!(err, SyncError::Storage(StorageError::Unavailable(_))));
    assert_eq!(
        err.to_string(),
        "storage error: persistent storage unavailable: quota exceeded"
    );
}

#[test]
fn offline_and_channel_closed_display() {
    assert_eq!(SyncError::Offline.to_string(), "device is offline");
    assert_eq!(SyncError::ChannelClosed.to_string(), "sync coordinator not running");
}
