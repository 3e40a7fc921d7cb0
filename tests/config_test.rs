//! Config loading and defaults integration tests

use std::path::PathBuf;

use tempfile::TempDir;
use vidtrackr_sync::config::{BroadcastKind, Config, RemoteKind};
use vidtrackr_sync::SyncError;

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.node.data_dir, PathBuf::from(".vidtrackr"));
    assert_eq!(config.remote.kind, RemoteKind::File);
    assert_eq!(config.leader.lease_ttl_ms, 8000);
}

#[test]
fn test_config_with_all_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vidtrackr-sync.toml");
    std::fs::write(
        &path,
        r#"
[node]
data_dir = "/var/lib/vidtrackr"
process_id = "kiosk-1"

[sync]
debounce_ms = 1000
poll_interval_ms = 10000
remote_timeout_ms = 5000
init_timeout_ms = 2000

[leader]
lease_ttl_ms = 6000
renew_interval_ms = 2000
broadcast = "none"
bus_poll_ms = 100

[remote]
kind = "http"
base_url = "https://sheets.example.com"
document_id = "team-pipeline"
api_token = "secret"
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.node.process_id.as_deref(), Some("kiosk-1"));
    assert_eq!(config.sync.poll_interval_ms, 10000);
    assert_eq!(config.leader.broadcast, BroadcastKind::None);
    assert_eq!(config.remote.api_token.as_deref(), Some("secret"));

    let engine = config.engine_config("kiosk-1".to_string());
    assert_eq!(engine.debounce.as_millis(), 1000);
    assert_eq!(engine.lease_ttl.as_millis(), 6000);
    assert_eq!(engine.init_timeout.as_millis(), 2000);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[sync\ndebounce_ms = ").unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
fn test_load_rejects_renew_not_shorter_than_ttl() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lease.toml");
    std::fs::write(&path, "[leader]\nlease_ttl_ms = 2000\nrenew_interval_ms = 2500\n").unwrap();

    assert!(matches!(Config::load(&path), Err(SyncError::Config(_))));
}

#[tokio::test]
async fn test_device_channel_opens_lease_and_bus() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.node.data_dir = dir.path().join("state");

    let (lease, bus) = config.device_channel();
    assert!(lease.is_some());
    assert!(bus.is_some());
}

#[tokio::test]
async fn test_unusable_data_dir_runs_without_channel() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("occupied");
    std::fs::write(&blocker, "not a directory").unwrap();
    let mut config = Config::default();
    config.node.data_dir = blocker.join("state");

    let (lease, bus) = config.device_channel();
    assert!(lease.is_none());
    assert!(bus.is_none());
}

#[tokio::test]
async fn test_broadcast_none_skips_channel() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.node.data_dir = dir.path().to_path_buf();
    config.leader.broadcast = BroadcastKind::None;

    let (lease, bus) = config.device_channel();
    assert!(lease.is_none() && bus.is_none());
    assert!(!dir.path().join("state.db").exists());
}
