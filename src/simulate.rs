//! In-process end-to-end run of all three roles.
//!
//! One WiFi gateway, one mesh gateway and a handful of sender nodes are wired
//! over [`MemoryHub`] and [`memory_link_pair`], with a static firmware source
//! in place of the manifest server. Senders announce an older firmware
//! version, the distributor pushes the image through the mesh gateway, and
//! each sender that flashes it asks for a restart, which ends its loop.
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::cloud::MemoryTelemetry;
use crate::config::Config;
use crate::ota::manifest::sha256_hex;
use crate::ota::{MemoryFlashSink, SessionInfo, StaticFirmwareSource};
use crate::protocol::{is_newer, DeviceRole};
use crate::roles::{shutdown_channel, GatewayStats, MeshGateway, RunOutcome, SenderNode, WifiGateway};
use crate::sensor::SimulatedSensor;
use crate::transport::memory::{memory_link_pair, MemoryHub};
use crate::transport::NodeId;

pub const MESH_GATEWAY_ID: NodeId = NodeId(100);
pub const FIRST_SENDER_ID: u32 = 1001;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub senders: usize,
    pub firmware: Vec<u8>,
    pub version: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderResult {
    pub node_id: NodeId,
    pub outcome: String,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub firmware_version: String,
    pub firmware_size: usize,
    pub firmware_sha256: String,
    pub senders: Vec<SenderResult>,
    pub all_updated: bool,
    pub open_sessions: Vec<SessionInfo>,
    pub gateway: GatewayStats,
}

pub async fn run(base: &Config, opts: SimulationOptions) -> Result<SimulationReport> {
    if opts.firmware.is_empty() {
        return Err(anyhow!("firmware image is empty"));
    }
    if !is_newer(&base.device.fw_version, &opts.version) {
        warn!(
            "simulated version {} is not newer than sender firmware {}; no update will happen",
            opts.version, base.device.fw_version
        );
    }

    let hub = MemoryHub::new();
    let (gateways_stop, gateways_rx) = shutdown_channel();
    let (senders_stop, senders_rx) = shutdown_channel();
    let ((mesh_link, mesh_serial_rx), (wifi_link, wifi_serial_rx)) = memory_link_pair();

    let mut wifi_cfg = base.clone();
    wifi_cfg.device.node_id = 1;
    wifi_cfg.device.name = "wifi-gateway".into();
    wifi_cfg.ota.auto_enabled = true;
    let source = StaticFirmwareSource::single(&opts.version, DeviceRole::Sender.as_key(), opts.firmware.clone());
    let (wifi, handle) = WifiGateway::new(&wifi_cfg, wifi_link, wifi_serial_rx, source, MemoryTelemetry::new());

    let mut mesh_cfg = base.clone();
    mesh_cfg.device.node_id = MESH_GATEWAY_ID.0;
    let (mesh, mesh_rx) = hub.join(MESH_GATEWAY_ID);
    let mesh_gw = MeshGateway::new(&mesh_cfg, mesh, mesh_rx, mesh_link, mesh_serial_rx);

    let wifi_task = tokio::spawn(wifi.run(gateways_rx.clone()));
    let mesh_task = tokio::spawn(mesh_gw.run(gateways_rx));

    let mut senders = JoinSet::new();
    for i in 0..opts.senders {
        let id = NodeId(FIRST_SENDER_ID + i as u32);
        let mut cfg = base.clone();
        cfg.device.node_id = id.0;
        cfg.device.name = format!("Sender-{}", i + 1);
        cfg.device.access_token = format!("sim-token-{}", id);
        let (mesh, events) = hub.join(id);
        let node = SenderNode::new(
            &cfg,
            mesh,
            events,
            SimulatedSensor::new(id.0 as u64, cfg.sender.simulated_event_probability),
            MemoryFlashSink::new(),
        );
        let rx = senders_rx.clone();
        senders.spawn(async move { (id, node.run(rx).await) });
    }
    info!("simulation: {} sender(s) announcing {}", opts.senders, base.device.fw_version);

    let mut results = Vec::new();
    let collect = async {
        while let Some(joined) = senders.join_next().await {
            match joined {
                Ok((id, Ok(outcome))) => {
                    hub.leave(id);
                    results.push(SenderResult {
                        node_id: id,
                        updated: matches!(&outcome, RunOutcome::Restart { reason } if reason == "update_ok"),
                        outcome: format!("{outcome:?}"),
                    });
                }
                Ok((id, Err(e))) => warn!("sender {} failed: {}", id, e),
                Err(e) => warn!("sender task failed: {}", e),
            }
        }
    };
    if tokio::time::timeout(opts.timeout, collect).await.is_err() {
        warn!("simulation timed out after {}s", opts.timeout.as_secs());
    }
    let _ = senders_stop.send(true);
    senders.shutdown().await;
    results.sort_by_key(|r| r.node_id);

    // let the last ota_result travel up before reading the gateway state
    tokio::time::sleep(Duration::from_millis(200)).await;
    let gateway = handle.stats().await?;
    let open_sessions = handle.sessions().await?;
    let _ = gateways_stop.send(true);
    wifi_task.await??;
    mesh_task.await??;

    Ok(SimulationReport {
        firmware_version: opts.version,
        firmware_size: opts.firmware.len(),
        firmware_sha256: sha256_hex(&opts.firmware),
        all_updated: results.len() == opts.senders && results.iter().all(|r| r.updated),
        senders: results,
        open_sessions,
        gateway,
    })
}
