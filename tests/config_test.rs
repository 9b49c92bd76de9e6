//! Config persistence.

use channelmux::Config;
use tempfile::TempDir;

#[test]
fn test_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    assert_eq!(Config::load_from(dir.path()).unwrap(), Config::default());
}

#[test]
fn test_save_and_load_round_trip_without_token() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        base_url: "wss://rt.example.com".to_string(),
        token: Some("secret".to_string()),
        reconnect_delay_ms: 750,
        heartbeat_secs: Some(30),
        ..Config::default()
    };

    let path = config.save_to(dir.path()).unwrap();
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(!on_disk.contains("secret"));

    let loaded = Config::load_from(dir.path()).unwrap();
    assert_eq!(loaded.base_url, "wss://rt.example.com");
    assert_eq!(loaded.reconnect_delay_ms, 750);
    assert_eq!(loaded.heartbeat_secs, Some(30));
    assert_eq!(loaded.token, None);
}

#[cfg(unix)]
#[test]
fn test_saved_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = Config::default().save_to(dir.path()).unwrap();
    let mode = std::fs::metadata(path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_partial_file_fills_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"base_url": "ws://10.0.0.2:9000"}"#,
    )
    .unwrap();
    let loaded = Config::load_from(dir.path()).unwrap();
    assert_eq!(loaded.base_url, "ws://10.0.0.2:9000");
    assert_eq!(loaded.poll_interval_ms, Config::default().poll_interval_ms);
}

#[test]
fn test_invalid_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
    assert!(Config::load_from(dir.path()).is_err());
}

#[test]
fn test_endpoints_from_config() {
    let config = Config {
        base_url: "https://rt.example.com".to_string(),
        token: Some("abc".to_string()),
        ..Config::default()
    };
    let endpoints = config.endpoints().unwrap();
    let address = endpoints
        .address(&channelmux::FeedKind::Presence)
        .unwrap();
    assert_eq!(address.as_str(), "wss://rt.example.com/ws/users/?token=abc");
}
