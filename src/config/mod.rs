//! # Configuration Management Module
//!
//! One TOML file configures whichever role the process runs. Sections not
//! used by a role are ignored; every tunable has a default so a minimal file
//! only needs `[device]`.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - identity of this node (id, name, firmware version, token)
//! - [`SerialConfig`] - gateway-to-gateway serial link and its pacing
//! - [`MeshConfig`] - mesh adapter, heartbeat and status cadence
//! - [`RelayConfig`] - relay queue capacity, congestion threshold and batching
//! - [`SenderConfig`] - sensor cadence and flash staging path
//! - [`OtaConfig`] - transfer timeouts, failure threshold, manifest source
//! - [`RegistryConfig`] - WiFi gateway presence sweep
//! - [`CloudConfig`] - telemetry endpoint
//! - [`WebConfig`] - management HTTP surface
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use quakemesh::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("quakemesh.toml").await?;
//!     println!("Node {} ({})", config.device.node_id, config.device.name);
//!
//!     Config::create_default("quakemesh.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! node_id = 1001
//! name = "Sender-01"
//! fw_version = "2.1.0"
//! access_token = "abc123"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [ota]
//! manifest_url = "https://example.org/ota/manifest.json"
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::errors::QuakeError;
use crate::ota::{DistributorConfig, ReceiverConfig};
use crate::relay::RelayQueueConfig;
use crate::transport::line::LinePacing;
use crate::transport::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Mesh node id of this device.
    pub node_id: u32,
    pub name: String,
    pub fw_version: String,
    /// Cloud token sent with sensor readings (sender role).
    #[serde(default)]
    pub access_token: String,
}

impl DeviceConfig {
    pub fn id(&self) -> NodeId {
        NodeId(self.node_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
    #[serde(default = "default_piece_size")]
    pub piece_size: usize,
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
}

fn default_chunk_threshold() -> usize {
    1000
}
fn default_piece_size() -> usize {
    128
}
fn default_pace_ms() -> u64 {
    2
}

impl SerialConfig {
    pub fn pacing(&self) -> LinePacing {
        LinePacing {
            chunk_threshold: self.chunk_threshold,
            piece_size: self.piece_size,
            pause: Duration::from_millis(self.pace_ms),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            chunk_threshold: default_chunk_threshold(),
            piece_size: default_piece_size(),
            pace_ms: default_pace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// UDP port shared by every node of the LAN mesh adapter.
    pub udp_port: u16,
    pub heartbeat_interval_secs: u64,
    pub node_timeout_secs: u64,
    pub max_missed_heartbeats: u32,
    pub status_interval_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            udp_port: 5555,
            heartbeat_interval_secs: 20,
            node_timeout_secs: 30,
            max_missed_heartbeats: 2,
            status_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub capacity: usize,
    pub congestion_threshold_pct: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            congestion_threshold_pct: 70,
            batch_size: 5,
            batch_interval_ms: 20,
        }
    }
}

impl RelayConfig {
    pub fn queue(&self) -> RelayQueueConfig {
        RelayQueueConfig {
            capacity: self.capacity,
            congestion_threshold_pct: self.congestion_threshold_pct,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    pub read_interval_ms: u64,
    pub send_interval_ms: u64,
    /// Larger sensor payloads fall back to the minimal document.
    pub max_payload_bytes: usize,
    /// Re-announce the running version; 0 only announces at startup.
    pub ota_check_interval_secs: u64,
    /// Where received firmware images are committed.
    pub flash_path: String,
    /// Chance per read of a synthetic event (simulated sensor).
    #[serde(default)]
    pub simulated_event_probability: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            read_interval_ms: 1000,
            send_interval_ms: 1000,
            max_payload_bytes: 800,
            ota_check_interval_secs: 600,
            flash_path: "./firmware/incoming.bin".to_string(),
            simulated_event_probability: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaConfig {
    pub chunk_size: u32,
    pub chunk_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub max_failures: u32,
    pub auto_enabled: bool,
    pub auto_cooldown_secs: u64,
    pub manifest_url: String,
    pub manifest_cache_secs: u64,
    pub manifest_timeout_secs: u64,
    pub firmware_timeout_secs: u64,
    pub timeout_check_interval_secs: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_timeout_secs: 30,
            session_timeout_secs: 300,
            max_failures: 5,
            auto_enabled: true,
            auto_cooldown_secs: 300,
            manifest_url: "https://example.org/quakemesh/ota/manifest.json".to_string(),
            manifest_cache_secs: 300,
            manifest_timeout_secs: 15,
            firmware_timeout_secs: 30,
            timeout_check_interval_secs: 5,
        }
    }
}

impl OtaConfig {
    pub fn receiver(&self) -> ReceiverConfig {
        ReceiverConfig {
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            max_failures: self.max_failures,
        }
    }

    pub fn distributor(&self) -> DistributorConfig {
        DistributorConfig {
            chunk_size: self.chunk_size,
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            auto_enabled: self.auto_enabled,
            auto_cooldown: Duration::from_secs(self.auto_cooldown_secs),
            manifest_ttl: Duration::from_secs(self.manifest_cache_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub offline_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            offline_after_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://demo.thingsboard.io:80".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Config file {}: {}", path, e))?;
        Ok(config)
    }

    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> Result<(), QuakeError> {
        let fail = |msg: &str| Err(QuakeError::Config(msg.to_string()));
        if self.device.node_id == 0 {
            return fail("device.node_id must be non-zero");
        }
        if self.device.fw_version.parse::<crate::protocol::FirmwareVersion>().is_err() {
            return fail("device.fw_version must look like major.minor.patch");
        }
        if self.ota.chunk_size == 0 {
            return fail("ota.chunk_size must be positive");
        }
        if self.ota.max_failures == 0 {
            return fail("ota.max_failures must be positive");
        }
        if self.relay.capacity == 0 || self.relay.batch_size == 0 {
            return fail("relay.capacity and relay.batch_size must be positive");
        }
        if self.relay.congestion_threshold_pct > 100 {
            return fail("relay.congestion_threshold_pct must be 0..=100");
        }
        if self.serial.piece_size == 0 {
            return fail("serial.piece_size must be positive");
        }
        if self.mesh.max_missed_heartbeats == 0 {
            return fail("mesh.max_missed_heartbeats must be positive");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig {
                node_id: 1,
                name: "quakemesh-node".to_string(),
                fw_version: env!("CARGO_PKG_VERSION").to_string(),
                access_token: String::new(),
            },
            serial: SerialConfig::default(),
            mesh: MeshConfig::default(),
            relay: RelayConfig::default(),
            sender: SenderConfig::default(),
            ota: OtaConfig::default(),
            registry: RegistryConfig::default(),
            cloud: CloudConfig::default(),
            web: WebConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("quakemesh.log".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [device]
            node_id = 42
            name = "S42"
            fw_version = "2.1.0"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.relay.capacity, 200);
        assert_eq!(cfg.relay.congestion_threshold_pct, 70);
        assert_eq!(cfg.ota.chunk_timeout_secs, 30);
        assert_eq!(cfg.ota.session_timeout_secs, 300);
        assert_eq!(cfg.serial.pacing().piece_size, 128);
        assert_eq!(cfg.registry.offline_after_secs, 60);
    }

    #[test]
    fn rejects_zero_node_id() {
        let mut cfg = Config::default();
        cfg.device.node_id = 0;
        assert!(matches!(cfg.validate(), Err(QuakeError::Config(_))));
    }

    #[tokio::test]
    async fn default_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quakemesh.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let cfg = Config::load(path).await.unwrap();
        assert_eq!(cfg.ota.chunk_size, 512);
        assert_eq!(cfg.logging.file.as_deref(), Some("quakemesh.log"));
    }
}
