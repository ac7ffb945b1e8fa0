/// Loading configuration files from disk.
use quakemesh::config::Config;
use tempfile::tempdir;
use tokio_test::assert_ok;

const GATEWAY_TOML: &str = r#"
[device]
node_id = 100
name = "mesh-gw-north"
fw_version = "2.1.4"

[serial]
port = "/dev/ttyAMA0"
baud_rate = 57600

[relay]
capacity = 50
congestion_threshold_pct = 80

[mesh]
heartbeat_interval_secs = 10
max_missed_heartbeats = 3

[ota]
chunk_size = 256
auto_enabled = false

[logging]
level = "debug"
"#;

#[tokio::test]
async fn test_load_gateway_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gateway.toml");
    std::fs::write(&path, GATEWAY_TOML).unwrap();

    let config = assert_ok!(Config::load(path.to_str().unwrap()).await);
    assert_eq!(config.device.node_id, 100);
    assert_eq!(config.device.fw_version, "2.1.4");
    assert_eq!(config.serial.baud_rate, 57600);
    assert_eq!(config.relay.capacity, 50);
    assert_eq!(config.relay.batch_size, 5);
    assert_eq!(config.mesh.max_missed_heartbeats, 3);
    assert_eq!(config.mesh.udp_port, 5555);
    assert_eq!(config.ota.chunk_size, 256);
    assert!(!config.ota.auto_enabled);
    assert_eq!(config.ota.max_failures, 5);
    assert_eq!(config.logging.level, "debug");
    assert!(config.cloud.enabled);

    let queue = config.relay.queue();
    assert_eq!(queue.capacity, 50);
    assert_eq!(queue.congestion_threshold_pct, 80);
}

#[tokio::test]
async fn test_rejects_invalid_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    let bad = GATEWAY_TOML.replace("chunk_size = 256", "chunk_size = 0");
    std::fs::write(&path, bad).unwrap();
    assert!(Config::load(path.to_str().unwrap()).await.is_err());

    let bad = GATEWAY_TOML.replace("fw_version = \"2.1.4\"", "fw_version = \"latest\"");
    std::fs::write(&path, bad).unwrap();
    assert!(Config::load(path.to_str().unwrap()).await.is_err());
}

#[tokio::test]
async fn test_missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = Config::load(path.to_str().unwrap()).await.unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[tokio::test]
async fn test_init_writes_loadable_default() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("quakemesh.toml");
    let path = path.to_str().unwrap();
    Config::create_default(path).await.unwrap();
    let config = Config::load(path).await.unwrap();
    assert_eq!(config.device.fw_version, env!("CARGO_PKG_VERSION"));
    assert_eq!(config.ota.chunk_size, 512);
}
