//! Configuration file tests
//!
//! Run with: `cargo test -p bridge --test config_tests`

use bridge::BridgeConfig;
use bridge::config::load_config;
use std::fs;
use tempfile::TempDir;

// ============================================================================
// Save / load
// ============================================================================

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("bridge.toml");

    let mut config = BridgeConfig::default();
    config.bridge.log_level = "debug".to_string();
    config.peer.max_open_retries = Some(7);
    config.diag.enabled = true;
    config.diag.device_info_path = Some("/dev/block/devinfo".into());
    config.save(&path).unwrap();

    let loaded = BridgeConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.bridge.log_level, "debug");
    assert_eq!(loaded.peer.max_open_retries, Some(7));
    assert!(loaded.diag.enabled);
    assert_eq!(
        loaded.diag.device_info_path.as_deref(),
        Some(std::path::Path::new("/dev/block/devinfo"))
    );
    assert_eq!(loaded.ports, config.ports);
}

#[test]
fn test_minimal_file_gets_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(&path, "[bridge]\nlog_level = \"warn\"\n").unwrap();

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.bridge.log_level, "warn");
    assert_eq!(config.bridge.workers, 2);
    assert_eq!(config.pool.rx_queue_size, 8);
    assert_eq!(config.peer.open_retry_ms, 1_000);
    assert_eq!(config.ports.len(), 2);
    assert_eq!(config.ports[1].data_channel, "SDIO_NMEA");
    assert!(!config.diag.enabled);
}

#[test]
fn test_custom_port_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(
        &path,
        r#"
[bridge]
log_level = "info"

[pool]
rx_queue_size = 4
tx_buf_size = 4096

[[ports]]
data_channel = "SDIO_DUN"
control_channel = 9

[[ports]]
data_channel = "SDIO_DIAG"
control_channel = 12

[[ports]]
data_channel = "SDIO_RPC"
control_channel = 13
"#,
    )
    .unwrap();

    let config = BridgeConfig::load(Some(path)).unwrap();
    assert_eq!(config.ports.len(), 3);
    assert_eq!(config.ports[2].control_channel, 13);
    assert_eq!(config.pool.rx_queue_size, 4);
    assert_eq!(config.pool.rx_buf_size, 2048);
    assert_eq!(config.pool.tx_buf_size, 4096);
}

// ============================================================================
// Rejected files
// ============================================================================

#[test]
fn test_invalid_toml_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(&path, "[bridge\nlog_level = ").unwrap();

    let err = BridgeConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(
        &path,
        r#"
[bridge]
log_level = "info"

[[ports]]
data_channel = "SDIO_CHANNEL_TOO_LONG"
control_channel = 9
"#,
    )
    .unwrap();

    assert!(BridgeConfig::load(Some(path)).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");

    let err = BridgeConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read config file"));
}
