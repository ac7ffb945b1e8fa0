/// Three-tier run over in-memory transports: sender nodes announce an older
/// firmware, the WiFi gateway distributes a new image through the mesh
/// gateway, every sender flashes it and restarts.
use std::time::Duration;

use quakemesh::config::Config;
use quakemesh::simulate::{self, SimulationOptions, FIRST_SENDER_ID};
use quakemesh::transport::NodeId;

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.device.fw_version = "2.1.0".into();
    config.cloud.enabled = false;
    config.logging.file = None;
    config
}

#[tokio::test]
async fn test_every_sender_takes_the_update() {
    let image = firmware(1700);
    let report = simulate::run(
        &base_config(),
        SimulationOptions {
            senders: 2,
            firmware: image.clone(),
            version: "2.2.0".into(),
            timeout: Duration::from_secs(20),
        },
    )
    .await
    .unwrap();

    assert!(report.all_updated, "report: {:?}", report.senders);
    assert_eq!(report.firmware_size, 1700);
    let ids: Vec<NodeId> = report.senders.iter().map(|s| s.node_id).collect();
    assert_eq!(ids, vec![NodeId(FIRST_SENDER_ID), NodeId(FIRST_SENDER_ID + 1)]);
    assert!(report.open_sessions.is_empty());
    assert_eq!(report.gateway.ota.completed, 2);
    assert_eq!(report.gateway.ota.offers_sent, 2);
    // 1700 bytes at 512 per chunk
    assert_eq!(report.gateway.ota.chunks_sent, 8);
}

#[tokio::test]
async fn test_current_firmware_is_left_alone() {
    let report = simulate::run(
        &base_config(),
        SimulationOptions {
            senders: 1,
            firmware: firmware(600),
            version: "2.1.0".into(),
            timeout: Duration::from_millis(1500),
        },
    )
    .await
    .unwrap();

    assert!(!report.all_updated);
    assert!(report.senders.is_empty());
    assert_eq!(report.gateway.ota.offers_sent, 0);
}

#[tokio::test]
async fn test_empty_image_is_rejected() {
    let result = simulate::run(
        &base_config(),
        SimulationOptions {
            senders: 1,
            firmware: Vec::new(),
            version: "9.9.9".into(),
            timeout: Duration::from_secs(1),
        },
    )
    .await;
    assert!(result.is_err());
}
