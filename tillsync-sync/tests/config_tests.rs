use tillsync_sync::{SyncConfig, SyncError};

#[test]
fn defaults_match_documented_values() {
    let config = SyncConfig::default();
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.online_debounce_ms, 1000);
    assert_eq!(config.request_timeout_secs, 30);
    assert_eq!(config.signal_poll_interval_secs, 5);
    assert_eq!(config.event_capacity, 64);
    assert!(config.validate().is_ok());
}

#[test]
fn partial_json_fills_defaults() {
    let config: SyncConfig =
        serde_json::from_str(r#"{ "api_base_url": "https://pos.example.com/api/v1" }"#).unwrap();
    assert_eq!(config.api_base_url, "https://pos.example.com/api/v1");
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.online_debounce().as_millis(), 1000);
}

#[test]
fn zero_retries_is_rejected() {
    let config = SyncConfig {
        max_retries: 0,
        ..SyncConfig::default()
    };
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));
}

#[test]
fn empty_base_url_is_rejected() {
    let config = SyncConfig::for_base_url("");
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));
}

#[test]
fn signal_poll_interval_has_floor() {
    let config = SyncConfig {
        signal_poll_interval_secs: 0,
        ..SyncConfig::default()
    };
    assert_eq!(config.signal_poll_interval().as_secs(), 1);
}
