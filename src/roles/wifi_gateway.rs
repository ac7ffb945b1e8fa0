//! WiFi gateway: serial intake, presence registry, cloud forwarding and OTA
//! distribution.
//!
//! The loop is the single owner of the registry and the [`Distributor`]. The
//! management surface reaches it through [`GatewayHandle`], which sends a
//! [`ManagementCommand`] carrying a oneshot reply channel.
//!
//! Firmware downloads and telemetry posts are awaited inside the loop
//! iteration that needs them, each bounded by its own timeout.
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use super::{send_upstream, wait_shutdown, RunOutcome, ShutdownRx};
use crate::cloud::{TelemetryPoint, TelemetrySink};
use crate::config::Config;
use crate::errors::{QuakeError, QuakeResult};
use crate::health::{Identity, NodeRegistry, NodeStatus, NodeView, SensorSnapshot};
use crate::logutil::escape_log;
use crate::metrics;
use crate::ota::distributor::DistributorStats;
use crate::ota::{Distributor, FirmwareSource, Manifest, OtaAction, SessionInfo};
use crate::protocol::{DeviceRole, EarthquakeReading, Envelope, MeshStatus, PriorityLabel};
use crate::transport::{NodeId, SerialLink};

/// Requests from the management surface.
#[derive(Debug)]
pub enum ManagementCommand {
    ListNodes(oneshot::Sender<Vec<NodeView>>),
    Stats(oneshot::Sender<GatewayStats>),
    Manifest(oneshot::Sender<Option<ManifestView>>),
    RefreshManifest(oneshot::Sender<QuakeResult<Manifest>>),
    TriggerOta {
        node: NodeId,
        reply: oneshot::Sender<QuakeResult<SessionInfo>>,
    },
    CancelOta {
        node: NodeId,
        reply: oneshot::Sender<bool>,
    },
    /// `None` toggles. Replies with the new setting.
    SetAutoOta {
        enabled: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    Sessions(oneshot::Sender<Vec<SessionInfo>>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestView {
    pub manifest: Manifest,
    pub age_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub gateway_id: NodeId,
    pub version: String,
    pub uptime_secs: u64,
    pub lines_received: u64,
    pub parse_errors: u64,
    pub telemetry_sent: u64,
    pub telemetry_failed: u64,
    pub nodes_total: usize,
    pub nodes_online: usize,
    pub auto_ota: bool,
    pub ota_sessions: usize,
    pub ota: DistributorStats,
    pub mesh: Option<MeshStatus>,
    pub process: metrics::Snapshot,
}

/// Cloneable client side of the management channel.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<ManagementCommand>,
}

impl GatewayHandle {
    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagementCommand) -> QuakeResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| QuakeError::LoopClosed)?;
        rx.await.map_err(|_| QuakeError::LoopClosed)
    }

    pub async fn nodes(&self) -> QuakeResult<Vec<NodeView>> {
        self.ask(ManagementCommand::ListNodes).await
    }

    pub async fn stats(&self) -> QuakeResult<GatewayStats> {
        self.ask(ManagementCommand::Stats).await
    }

    pub async fn manifest(&self) -> QuakeResult<Option<ManifestView>> {
        self.ask(ManagementCommand::Manifest).await
    }

    pub async fn refresh_manifest(&self) -> QuakeResult<Manifest> {
        self.ask(ManagementCommand::RefreshManifest).await?
    }

    pub async fn trigger_ota(&self, node: NodeId) -> QuakeResult<SessionInfo> {
        self.ask(|reply| ManagementCommand::TriggerOta { node, reply })
            .await?
    }

    pub async fn cancel_ota(&self, node: NodeId) -> QuakeResult<bool> {
        self.ask(|reply| ManagementCommand::CancelOta { node, reply })
            .await
    }

    pub async fn toggle_auto_ota(&self) -> QuakeResult<bool> {
        self.ask(|reply| ManagementCommand::SetAutoOta { enabled: None, reply })
            .await
    }

    pub async fn set_auto_ota(&self, enabled: bool) -> QuakeResult<bool> {
        self.ask(|reply| ManagementCommand::SetAutoOta {
            enabled: Some(enabled),
            reply,
        })
        .await
    }

    pub async fn sessions(&self) -> QuakeResult<Vec<SessionInfo>> {
        self.ask(ManagementCommand::Sessions).await
    }
}

#[derive(Debug, Clone, Default)]
struct Counters {
    lines_received: u64,
    parse_errors: u64,
    telemetry_sent: u64,
    telemetry_failed: u64,
}

pub struct WifiGateway<L: SerialLink, F: FirmwareSource, T: TelemetrySink> {
    id: NodeId,
    version: String,
    link: L,
    serial_rx: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedReceiver<ManagementCommand>,
    registry: NodeRegistry,
    distributor: Distributor<F>,
    telemetry: T,
    cloud_enabled: bool,
    offline_after: Duration,
    sweep_every: Duration,
    ota_check_every: Duration,
    last_mesh_status: Option<MeshStatus>,
    counters: Counters,
    started: Instant,
}

impl<L: SerialLink, F: FirmwareSource, T: TelemetrySink> WifiGateway<L, F, T> {
    pub fn new(
        config: &Config,
        link: L,
        serial_rx: mpsc::UnboundedReceiver<String>,
        source: F,
        telemetry: T,
    ) -> (Self, GatewayHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let gateway = Self {
            id: config.device.id(),
            version: config.device.fw_version.clone(),
            link,
            serial_rx,
            commands,
            registry: NodeRegistry::new(),
            distributor: Distributor::new(source, config.ota.distributor()),
            telemetry,
            cloud_enabled: config.cloud.enabled,
            offline_after: Duration::from_secs(config.registry.offline_after_secs),
            sweep_every: Duration::from_secs(config.registry.sweep_interval_secs.max(1)),
            ota_check_every: Duration::from_secs(config.ota.timeout_check_interval_secs.max(1)),
            last_mesh_status: None,
            counters: Counters::default(),
            started: Instant::now(),
        };
        (gateway, GatewayHandle { tx })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn distributor(&self) -> &Distributor<F> {
        &self.distributor
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub async fn on_serial_line(&mut self, raw: &str, now: Instant) {
        self.counters.lines_received += 1;
        metrics::inc_envelopes_received();
        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(e) => {
                self.counters.parse_errors += 1;
                metrics::inc_envelopes_malformed();
                debug!("dropping malformed serial line: {} ({})", escape_log(raw), e);
                return;
            }
        };
        match &envelope {
            Envelope::MeshData(m) => {
                let token = m
                    .access_token
                    .as_deref()
                    .or(m.data.access_token.as_deref());
                let identity = Identity {
                    display_name: m.device_name.as_deref().or(m.data.device_name.as_deref()),
                    role: m.data.role.as_deref(),
                    firmware_version: m.fw_version.as_deref().or(m.data.fw_version.as_deref()),
                    auth_token: token,
                };
                let high = m.priority == PriorityLabel::High;
                self.on_reading(m.source_node, identity, m.data.earthquake.as_ref(), high, now)
                    .await;
            }
            Envelope::SensorData(d) => {
                let Some(node) = d.node_id.filter(|n| !n.is_unspecified()) else {
                    debug!("sensor_data without node id ignored");
                    return;
                };
                let identity = Identity {
                    display_name: d.device_name.as_deref(),
                    role: d.role.as_deref(),
                    firmware_version: d.fw_version.as_deref(),
                    auth_token: d.access_token.as_deref(),
                };
                self.on_reading(node, identity, d.earthquake.as_ref(), false, now)
                    .await;
            }
            Envelope::NodeStatus(r) => {
                if let Some(node) = r.source_node {
                    self.registry.touch(node, now);
                    self.registry.update_identity(
                        node,
                        Identity {
                            display_name: r.device_name.as_deref(),
                            firmware_version: r.fw_version.as_deref(),
                            auth_token: r.access_token.as_deref(),
                            ..Default::default()
                        },
                    );
                }
            }
            Envelope::NodeConnected(c) => {
                self.registry.touch(c.node_id, now);
            }
            Envelope::NodeDisconnected(d) => {
                if self.registry.mark_inactive(d.node_id) {
                    info!(
                        "node {} disconnected ({})",
                        d.node_id,
                        d.reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            Envelope::NodeTimeout(t) => {
                if self.registry.mark_inactive(t.node_id) {
                    info!("node {} timed out after {} heartbeats", t.node_id, t.missed_heartbeats);
                }
            }
            Envelope::OtaCheckForward(f) => {
                self.on_version_check(f.source_node, &f.role, &f.fw_version, now)
                    .await;
            }
            Envelope::OtaCheck(c) => {
                if let Some(node) = c.source_node {
                    self.on_version_check(node, &c.role, &c.fw_version, now).await;
                }
            }
            Envelope::OtaAccept(_)
            | Envelope::OtaNext(_)
            | Envelope::OtaResult(_)
            | Envelope::OtaAbort(_) => {
                if let Envelope::OtaResult(r) = &envelope {
                    if let (true, Some(node)) = (r.ok, r.source_node) {
                        self.registry.update_identity(
                            node,
                            Identity {
                                firmware_version: r.new_version.as_deref(),
                                ..Default::default()
                            },
                        );
                    }
                }
                let actions = self.distributor.handle(NodeId::UNSPECIFIED, &envelope, now);
                self.apply(actions);
            }
            Envelope::GatewayStartup(g) => {
                info!("gateway {} online ({} v{})", g.gateway_id, g.role, g.version);
            }
            Envelope::MeshStatus(s) => {
                debug!(
                    "mesh {}: {} nodes, {} queued, {} dropped",
                    s.gateway_id, s.connected_nodes, s.queued_messages, s.dropped_messages
                );
                self.last_mesh_status = Some(s.clone());
            }
            other => debug!("ignoring {} from serial", other.kind()),
        }
    }

    async fn on_reading(
        &mut self,
        node: NodeId,
        identity: Identity<'_>,
        reading: Option<&EarthquakeReading>,
        high: bool,
        now: Instant,
    ) {
        self.registry.record_message(node, high, now);
        self.registry.update_identity(node, identity);
        let Some(eq) = reading else {
            return;
        };
        self.registry.update_reading(
            node,
            SensorSnapshot {
                si: eq.si,
                pga: eq.pga,
                temp: eq.temp,
            },
        );
        if !self.cloud_enabled {
            return;
        }
        let token = match self.registry.get(node).and_then(|r| r.auth_token.clone()) {
            Some(t) if !t.is_empty() => t,
            _ => {
                debug!("node {} has no access token, telemetry skipped", node);
                return;
            }
        };
        let point = TelemetryPoint {
            si: eq.si,
            pga: eq.pga,
            temp: eq.temp,
        };
        match self.telemetry.publish(&token, point).await {
            Ok(()) => self.counters.telemetry_sent += 1,
            Err(e) => {
                self.counters.telemetry_failed += 1;
                warn!("telemetry for node {} failed: {}", node, e);
            }
        }
    }

    async fn on_version_check(&mut self, node: NodeId, role: &str, fw_version: &str, now: Instant) {
        self.registry.touch(node, now);
        self.registry.update_identity(
            node,
            Identity {
                role: Some(role),
                firmware_version: Some(fw_version),
                ..Default::default()
            },
        );
        match self
            .distributor
            .on_version_check(node, role, fw_version, now)
            .await
        {
            Ok(actions) => self.apply(actions),
            Err(e) => warn!(target: "ota", "auto OTA for node {} not started: {}", node, e),
        }
    }

    fn apply(&mut self, actions: Vec<OtaAction>) {
        for action in actions {
            match action {
                OtaAction::Send { envelope, .. } => {
                    if let Envelope::OtaOffer(offer) = &envelope {
                        self.registry
                            .set_status(offer.target_node, NodeStatus::Updating);
                    }
                    send_upstream(&mut self.link, &envelope);
                }
                OtaAction::Closed(outcome) => {
                    self.registry.set_status(outcome.node_id, NodeStatus::Online);
                    info!(
                        target: "ota",
                        "OTA for node {} finished: {} ({}/{} bytes)",
                        outcome.node_id, outcome.message, outcome.bytes_transferred, outcome.total_size
                    );
                }
                OtaAction::Restart { .. } => {}
            }
        }
    }

    pub async fn trigger_ota(&mut self, node: NodeId, now: Instant) -> QuakeResult<SessionInfo> {
        let record = self.registry.get(node).ok_or(QuakeError::UnknownNode(node))?;
        let role = record
            .role
            .clone()
            .unwrap_or_else(|| DeviceRole::Sender.as_key().to_string());
        let actions = self.distributor.trigger(node, &role, now).await?;
        self.apply(actions);
        self.distributor
            .sessions(now)
            .into_iter()
            .find(|s| s.node_id == node)
            .ok_or(QuakeError::UnknownNode(node))
    }

    pub fn stats(&self, now: Instant) -> GatewayStats {
        GatewayStats {
            gateway_id: self.id,
            version: self.version.clone(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            lines_received: self.counters.lines_received,
            parse_errors: self.counters.parse_errors,
            telemetry_sent: self.counters.telemetry_sent,
            telemetry_failed: self.counters.telemetry_failed,
            nodes_total: self.registry.len(),
            nodes_online: self.registry.online_count(),
            auto_ota: self.distributor.auto_enabled(),
            ota_sessions: self.distributor.session_count(),
            ota: self.distributor.stats().clone(),
            mesh: self.last_mesh_status.clone(),
            process: metrics::snapshot(),
        }
    }

    pub async fn on_command(&mut self, command: ManagementCommand, now: Instant) {
        // a dropped reply receiver just means the caller went away
        match command {
            ManagementCommand::ListNodes(reply) => {
                let _ = reply.send(self.registry.view(now));
            }
            ManagementCommand::Stats(reply) => {
                let _ = reply.send(self.stats(now));
            }
            ManagementCommand::Manifest(reply) => {
                let view = self
                    .distributor
                    .cached_manifest(now)
                    .map(|(manifest, age)| ManifestView {
                        manifest,
                        age_secs: age.as_secs(),
                    });
                let _ = reply.send(view);
            }
            ManagementCommand::RefreshManifest(reply) => {
                let result = self.distributor.refresh_manifest(now).await;
                if let Ok(m) = &result {
                    info!(target: "ota", "manifest refreshed: latest {}", m.version);
                }
                let _ = reply.send(result);
            }
            ManagementCommand::TriggerOta { node, reply } => {
                let result = self.trigger_ota(node, now).await;
                if let Err(e) = &result {
                    warn!(target: "ota", "manual OTA for node {} refused: {}", node, e);
                }
                let _ = reply.send(result);
            }
            ManagementCommand::CancelOta { node, reply } => {
                let actions = self.distributor.cancel(node);
                let cancelled = !actions.is_empty();
                self.apply(actions);
                let _ = reply.send(cancelled);
            }
            ManagementCommand::SetAutoOta { enabled, reply } => {
                let next = enabled.unwrap_or(!self.distributor.auto_enabled());
                self.distributor.set_auto_enabled(next);
                info!(target: "ota", "automatic OTA {}", if next { "enabled" } else { "disabled" });
                let _ = reply.send(next);
            }
            ManagementCommand::Sessions(reply) => {
                let _ = reply.send(self.distributor.sessions(now));
            }
        }
    }

    pub fn sweep_tick(&mut self, now: Instant) {
        for node in self.registry.sweep_presence(now, self.offline_after) {
            info!("node {} offline", node);
        }
    }

    pub fn ota_tick(&mut self, now: Instant) {
        let actions = self.distributor.check_timeouts(now);
        self.apply(actions);
    }

    pub async fn run(mut self, mut shutdown: ShutdownRx) -> Result<RunOutcome> {
        info!("wifi gateway {} starting (v{})", self.id, self.version);
        let mut sweep = interval(self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ota = interval(self.ota_check_every);
        ota.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep_tick(Instant::now()),
                _ = ota.tick() => self.ota_tick(Instant::now()),
                line = self.serial_rx.recv() => {
                    let Some(line) = line else {
                        warn!("serial link closed");
                        return Ok(RunOutcome::Shutdown);
                    };
                    self.on_serial_line(&line, Instant::now()).await;
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command, Instant::now()).await;
                }
                _ = wait_shutdown(&mut shutdown) => {
                    info!("wifi gateway {} shutting down", self.id);
                    return Ok(RunOutcome::Shutdown);
                }
            }
        }
    }
}
