//! Mesh gateway: bridges the sensor mesh to the serial link.
//!
//! Upstream (mesh to serial) traffic goes through admission control and the
//! two relay queues, except OTA transfer lines which the [`OtaRelay`] forwards
//! at once in both directions. The gateway also runs the mesh-side liveness
//! tracking (heartbeat requests, missed-heartbeat escalation, topology
//! reconciliation) and reports itself upstream with `mesh_status`.
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::{send_mesh, send_mesh_raw, send_upstream, wait_shutdown, RunOutcome, ShutdownRx};
use crate::config::Config;
use crate::health::{Identity, NodeRegistry, SensorSnapshot};
use crate::logutil::escape_log;
use crate::metrics;
use crate::ota::{OtaRelay, RelayRoute};
use crate::protocol::{
    is_ota_line, now_millis, Command, DeviceRole, Envelope, GatewayStartup, HeartbeatRequest,
    MeshData, MeshNodeSummary, MeshStatus, NodeConnected, NodeDisconnected, NodeStatusReport,
    NodeTimeout, OtaCheckForward, PriorityLabel, SensorData, Welcome,
};
use crate::relay::{classify, Admission, PriorityClass, QueuedMessage, RelayQueue, PRIORITY_LIMIT};
use crate::transport::{MeshEvent, MeshTransport, NodeId, SerialLink};

#[derive(Debug, Clone)]
struct Cadence {
    heartbeat: Duration,
    node_timeout: Duration,
    max_missed: u32,
    status: Duration,
    drain: Duration,
}

pub struct MeshGateway<M: MeshTransport, L: SerialLink> {
    id: NodeId,
    version: String,
    mesh: M,
    mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
    link: L,
    serial_rx: mpsc::UnboundedReceiver<String>,
    queue: RelayQueue,
    registry: NodeRegistry,
    relay: OtaRelay,
    cadence: Cadence,
    received: u64,
    sent: u64,
    started: Instant,
}

impl<M: MeshTransport, L: SerialLink> MeshGateway<M, L> {
    pub fn new(
        config: &Config,
        mesh: M,
        mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
        link: L,
        serial_rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            id: mesh.node_id(),
            version: config.device.fw_version.clone(),
            mesh,
            mesh_rx,
            link,
            serial_rx,
            queue: RelayQueue::new(config.relay.queue()),
            registry: NodeRegistry::new(),
            relay: OtaRelay::new(Duration::from_secs(config.ota.session_timeout_secs)),
            cadence: Cadence {
                heartbeat: Duration::from_secs(config.mesh.heartbeat_interval_secs.max(1)),
                node_timeout: Duration::from_secs(config.mesh.node_timeout_secs),
                max_missed: config.mesh.max_missed_heartbeats,
                status: Duration::from_secs(config.mesh.status_interval_secs.max(1)),
                drain: Duration::from_millis(config.relay.batch_interval_ms.max(1)),
            },
            received: 0,
            sent: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn queue(&self) -> &RelayQueue {
        &self.queue
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &OtaRelay {
        &self.relay
    }

    fn upstream(&mut self, envelope: &Envelope) {
        if send_upstream(&mut self.link, envelope) {
            self.sent += 1;
        }
    }

    pub fn announce_startup(&mut self) {
        let startup = Envelope::GatewayStartup(GatewayStartup {
            gateway_id: self.id,
            timestamp: now_millis(),
            status: "online".into(),
            version: self.version.clone(),
            role: DeviceRole::MeshGateway.as_key().to_string(),
            features: vec![
                "priority_queue".into(),
                "admission_control".into(),
                "heartbeat".into(),
                "ota_relay".into(),
            ],
        });
        self.upstream(&startup);
    }

    pub fn on_mesh_event(&mut self, event: MeshEvent, now: Instant) {
        match event {
            MeshEvent::Received { from, payload } => self.on_mesh_payload(from, &payload, now),
            MeshEvent::NewConnection(node) => self.on_new_connection(node, now),
            MeshEvent::TopologyChanged => self.on_topology_changed(),
        }
    }

    fn on_new_connection(&mut self, node: NodeId, now: Instant) {
        info!("node {} joined the mesh", node);
        self.registry.touch(node, now);
        let welcome = Envelope::Welcome(Welcome {
            gateway_id: self.id,
            timestamp: now_millis(),
            version: self.version.clone(),
        });
        send_mesh(&mut self.mesh, Some(node), &welcome);
        self.upstream(&Envelope::NodeConnected(NodeConnected {
            node_id: node,
            gateway_id: self.id,
            timestamp: now_millis(),
        }));
    }

    fn on_topology_changed(&mut self) {
        let reachable = self.mesh.reachable_nodes();
        for node in self.registry.reconcile_roster(&reachable) {
            self.upstream(&Envelope::NodeDisconnected(NodeDisconnected {
                node_id: node,
                gateway_id: Some(self.id),
                timestamp: now_millis(),
                reason: Some("topology_change".into()),
            }));
        }
    }

    pub fn on_mesh_payload(&mut self, from: NodeId, raw: &str, now: Instant) {
        self.received += 1;
        metrics::inc_envelopes_received();
        let class = classify(raw);
        self.registry.record_message(from, class.is_high(), now);

        if is_ota_line(raw) {
            if let Ok(Envelope::OtaCheck(check)) = Envelope::parse(raw) {
                self.forward_version_check(from, &check.role, &check.fw_version);
                return;
            }
            if let Some(RelayRoute::Upstream { raw }) = self.relay.from_mesh(from, raw, now) {
                if self.link.send_line(&raw).is_ok() {
                    self.sent += 1;
                } else {
                    warn!(target: "ota", "failed to relay OTA reply from {}", from);
                }
            }
            return;
        }

        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(e) => {
                metrics::inc_envelopes_malformed();
                debug!("dropping malformed payload from {}: {} ({})", from, escape_log(raw), e);
                return;
            }
        };
        match envelope {
            Envelope::SensorData(data) => self.on_sensor_data(from, data, class, now),
            Envelope::NodeStatus(report) => self.on_node_status(from, report, class, now),
            Envelope::HeartbeatResponse(hb) => {
                self.registry.update_identity(
                    from,
                    Identity {
                        display_name: hb.device_name.as_deref(),
                        firmware_version: hb.fw_version.as_deref(),
                        ..Default::default()
                    },
                );
            }
            other => debug!("ignoring {} from {}", other.kind(), from),
        }
    }

    fn forward_version_check(&mut self, from: NodeId, role: &str, fw_version: &str) {
        self.registry.update_identity(
            from,
            Identity {
                role: Some(role),
                firmware_version: Some(fw_version),
                ..Default::default()
            },
        );
        info!(target: "ota", "node {} runs {} {}", from, role, fw_version);
        self.upstream(&Envelope::OtaCheckForward(OtaCheckForward {
            source_node: from,
            gateway_id: Some(self.id),
            role: role.to_string(),
            fw_version: fw_version.to_string(),
        }));
    }

    fn on_sensor_data(&mut self, from: NodeId, data: SensorData, class: PriorityClass, now: Instant) {
        let source = data.node_id.filter(|n| !n.is_unspecified()).unwrap_or(from);
        self.registry.update_identity(
            from,
            Identity {
                display_name: data.device_name.as_deref(),
                role: data.role.as_deref(),
                firmware_version: data.fw_version.as_deref(),
                auth_token: data.access_token.as_deref(),
            },
        );
        if let Some(eq) = &data.earthquake {
            self.registry.update_reading(
                from,
                SensorSnapshot {
                    si: eq.si,
                    pga: eq.pga,
                    temp: eq.temp,
                },
            );
        }
        let wrapped = Envelope::MeshData(MeshData {
            source_node: source,
            gateway_id: self.id,
            timestamp: now_millis(),
            priority: if class.is_high() {
                PriorityLabel::High
            } else {
                PriorityLabel::Normal
            },
            access_token: data.access_token.clone(),
            device_name: data.device_name.clone(),
            fw_version: data.fw_version.clone(),
            data,
        });
        self.enqueue(&wrapped, class, now);
    }

    fn on_node_status(&mut self, from: NodeId, mut report: NodeStatusReport, class: PriorityClass, now: Instant) {
        self.registry.update_identity(
            from,
            Identity {
                display_name: report.device_name.as_deref(),
                firmware_version: report.fw_version.as_deref(),
                auth_token: report.access_token.as_deref(),
                ..Default::default()
            },
        );
        report.source_node = Some(report.source_node.unwrap_or(from));
        report.gateway_id = Some(self.id);
        report.timestamp = Some(now_millis());
        // alert-bearing status reports keep the raw line's priority
        let class = if class.is_high() { PriorityClass::High } else { PriorityClass::Status };
        self.enqueue(&Envelope::NodeStatus(report), class, now);
    }

    fn enqueue(&mut self, envelope: &Envelope, class: PriorityClass, now: Instant) {
        let line = match envelope.to_line() {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to encode {}: {}", envelope.kind(), e);
                return;
            }
        };
        if let Admission::Dropped = self.queue.admit(QueuedMessage::new(line, class, now)) {
            debug!("{} dropped under congestion", envelope.kind());
        }
    }

    pub fn on_serial_line(&mut self, raw: &str, now: Instant) {
        if let Some(route) = self.relay.from_serial(raw, now) {
            match route {
                RelayRoute::ToNode { to, raw } => {
                    send_mesh_raw(&mut self.mesh, Some(to), &raw);
                }
                RelayRoute::Broadcast { raw } => {
                    send_mesh_raw(&mut self.mesh, None, &raw);
                }
                RelayRoute::Upstream { .. } => {}
            }
            return;
        }
        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(e) => {
                metrics::inc_envelopes_malformed();
                debug!("dropping malformed serial line: {} ({})", escape_log(raw), e);
                return;
            }
        };
        match envelope {
            Envelope::Command(cmd) => self.on_command(cmd),
            other => debug!("ignoring {} from serial", other.kind()),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match (cmd.command.as_str(), cmd.target_node) {
            ("restart_node", Some(target)) if !target.is_unspecified() => {
                info!("restart requested for node {}", target);
                let restart = Envelope::Command(Command {
                    command: "restart".into(),
                    target_node: Some(target),
                    from_gateway: Some(self.id),
                    timestamp: Some(now_millis()),
                });
                send_mesh(&mut self.mesh, Some(target), &restart);
            }
            (other, target) => debug!("ignoring command {} for {:?}", other, target),
        }
    }

    /// Broadcast a heartbeat request, then run one missed-heartbeat window.
    pub fn heartbeat_tick(&mut self, now: Instant) {
        let request = Envelope::HeartbeatRequest(HeartbeatRequest {
            gateway_id: self.id,
            timestamp: now_millis(),
            version: self.version.clone(),
        });
        send_mesh(&mut self.mesh, None, &request);
        let timeouts = self
            .registry
            .check_heartbeats(now, self.cadence.node_timeout, self.cadence.max_missed);
        for t in timeouts {
            self.upstream(&Envelope::NodeTimeout(NodeTimeout {
                node_id: t.node_id,
                gateway_id: Some(self.id),
                timestamp: now_millis(),
                missed_heartbeats: t.missed,
                device_name: t.display_name,
            }));
        }
    }

    /// One relay pass: the whole priority queue, then one normal batch.
    pub fn drain_tick(&mut self) -> usize {
        let batch = self.queue.drain_pass();
        let n = batch.len();
        for msg in batch {
            match self.link.send_line(&msg.payload) {
                Ok(()) => self.sent += 1,
                Err(e) => warn!("relay send failed ({:?}): {}", msg.priority, e),
            }
        }
        n
    }

    pub fn status(&self, now: Instant) -> MeshStatus {
        let stats = self.queue.stats();
        MeshStatus {
            gateway_id: self.id,
            timestamp: now_millis(),
            version: self.version.clone(),
            role: DeviceRole::MeshGateway.as_key().to_string(),
            connected_nodes: self.mesh.reachable_nodes().len(),
            total_messages_received: self.received,
            total_messages_sent: self.sent,
            total_batches_processed: stats.batches,
            dropped_messages: stats.dropped,
            queued_messages: self.queue.len(),
            priority_messages: self.queue.priority_len(),
            priority_limit: PRIORITY_LIMIT,
            active_node_count: self.registry.active_count(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            active_nodes: self
                .registry
                .iter()
                .filter(|r| r.is_active)
                .map(|r| MeshNodeSummary {
                    node_id: r.node_id,
                    device_name: r.display_name.clone(),
                    fw_version: r.firmware_version.clone(),
                    message_count: r.total_messages,
                    high_priority: r.is_high_priority,
                    idle_ms: r.silent_for(now).as_millis() as u64,
                })
                .collect(),
            ota_relays: self.relay.summaries(now),
        }
    }

    pub fn status_tick(&mut self, now: Instant) {
        for outcome in self.relay.expire(now) {
            info!(
                target: "ota",
                "relay session for {} expired after {} bytes",
                outcome.node_id, outcome.bytes_transferred
            );
        }
        let status = Envelope::MeshStatus(self.status(now));
        self.upstream(&status);
    }

    pub async fn run(mut self, mut shutdown: ShutdownRx) -> Result<RunOutcome> {
        info!("mesh gateway {} starting (v{})", self.id, self.version);
        self.announce_startup();

        let mut drain = interval(self.cadence.drain);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(self.cadence.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();
        let mut status = interval(self.cadence.status);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status.reset();

        loop {
            tokio::select! {
                _ = drain.tick() => {
                    self.drain_tick();
                }
                _ = heartbeat.tick() => self.heartbeat_tick(Instant::now()),
                _ = status.tick() => self.status_tick(Instant::now()),
                event = self.mesh_rx.recv() => {
                    let Some(event) = event else {
                        warn!("mesh adapter closed");
                        return Ok(RunOutcome::Shutdown);
                    };
                    self.on_mesh_event(event, Instant::now());
                }
                line = self.serial_rx.recv() => {
                    let Some(line) = line else {
                        warn!("serial link closed");
                        return Ok(RunOutcome::Shutdown);
                    };
                    self.on_serial_line(&line, Instant::now());
                }
                _ = wait_shutdown(&mut shutdown) => {
                    info!("mesh gateway {} shutting down", self.id);
                    return Ok(RunOutcome::Shutdown);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{memory_link_pair, MemoryHub, MemoryLink, MemoryMesh};

    struct Rig {
        gw: MeshGateway<MemoryMesh, MemoryLink>,
        upstream: mpsc::UnboundedReceiver<String>,
        hub: MemoryHub,
    }

    fn rig(config: &Config) -> Rig {
        let hub = MemoryHub::new();
        let (mesh, mesh_rx) = hub.join(NodeId(1));
        let ((link, serial_rx), (_, upstream)) = memory_link_pair();
        Rig {
            gw: MeshGateway::new(config, mesh, mesh_rx, link, serial_rx),
            upstream,
            hub,
        }
    }

    fn drain_lines(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(Envelope::parse(&line).unwrap());
        }
        out
    }

    #[test]
    fn sensor_data_is_wrapped_with_priority() {
        let mut r = rig(&Config::default());
        let now = Instant::now();
        let quake = r#"{"type":"sensor_data","node_id":5,"device_name":"S5","access_token":"t5","earthquake":{"status":"active","si":12,"pga":3,"temp":24.5}}"#;
        r.gw.on_mesh_payload(NodeId(5), quake, now);
        assert_eq!(r.gw.queue().priority_len(), 1);
        r.gw.drain_tick();
        let sent = drain_lines(&mut r.upstream);
        let Envelope::MeshData(m) = &sent[0] else {
            panic!("expected mesh_data, got {:?}", sent[0]);
        };
        assert_eq!(m.source_node, NodeId(5));
        assert_eq!(m.gateway_id, NodeId(1));
        assert_eq!(m.priority, PriorityLabel::High);
        assert_eq!(m.access_token.as_deref(), Some("t5"));
        assert_eq!(r.gw.registry().get(NodeId(5)).unwrap().total_messages, 1);
    }

    #[test]
    fn ota_check_becomes_forward() {
        let mut r = rig(&Config::default());
        r.gw.on_mesh_payload(
            NodeId(5),
            r#"{"type":"ota_check","role":"ROLE_SENDER_NODE","fw":"2.1.0"}"#,
            Instant::now(),
        );
        let sent = drain_lines(&mut r.upstream);
        assert_eq!(
            sent,
            vec![Envelope::OtaCheckForward(OtaCheckForward {
                source_node: NodeId(5),
                gateway_id: Some(NodeId(1)),
                role: "ROLE_SENDER_NODE".into(),
                fw_version: "2.1.0".into(),
            })]
        );
        assert!(r.gw.queue().is_empty());
    }

    #[tokio::test]
    async fn ota_lines_bypass_congested_queue() {
        let mut config = Config::default();
        config.relay.capacity = 10;
        let mut r = rig(&config);
        let (_node, mut node_rx) = r.hub.join(NodeId(5));
        let now = Instant::now();
        for i in 0..10 {
            r.gw.on_mesh_payload(NodeId(5), &format!(r#"{{"type":"node_status","seq":{i}}}"#), now);
        }
        assert!(r.gw.queue().is_congested());
        let dropped_before = r.gw.queue().stats().dropped;

        r.gw.on_serial_line(
            r#"{"type":"ota_offer","target_node":"5","version":"2.2.0","size":2048,"chunk":512}"#,
            now,
        );
        let Some(MeshEvent::Received { from, payload }) = node_rx.recv().await else {
            panic!("offer not relayed");
        };
        assert_eq!(from, NodeId(1));
        assert!(payload.contains("ota_offer"));

        r.gw.on_mesh_payload(NodeId(5), r#"{"type":"ota_accept","source_node":5}"#, now);
        let sent = drain_lines(&mut r.upstream);
        assert!(matches!(sent.last(), Some(Envelope::OtaAccept(_))));
        assert_eq!(r.gw.queue().stats().dropped, dropped_before);
        assert_eq!(r.gw.relay().active_sessions(), 1);
    }

    #[test]
    fn alert_status_admitted_at_95_percent() {
        let mut config = Config::default();
        config.relay.capacity = 20;
        let mut r = rig(&config);
        let now = Instant::now();
        for i in 0..15 {
            r.gw.on_mesh_payload(NodeId(5), &format!(r#"{{"type":"node_status","seq":{i}}}"#), now);
        }
        for _ in 0..4 {
            r.gw.on_mesh_payload(NodeId(6), r#"{"type":"sensor_data","earthquake":{"si":9,"pga":2}}"#, now);
        }
        assert_eq!(r.gw.queue().occupancy_pct(), 95);
        let dropped_before = r.gw.queue().stats().dropped;

        r.gw.on_mesh_payload(
            NodeId(7),
            r#"{"type":"node_status","status":"alert","device_name":"S7"}"#,
            now,
        );
        assert_eq!(r.gw.queue().stats().dropped, dropped_before);
        assert_eq!(r.gw.queue().priority_len(), 5);

        // a routine status at the same occupancy is refused
        r.gw.on_mesh_payload(NodeId(7), r#"{"type":"node_status","status":"ok"}"#, now);
        assert_eq!(r.gw.queue().stats().dropped, dropped_before + 1);
    }

    #[tokio::test]
    async fn restart_node_becomes_unicast_restart() {
        let mut r = rig(&Config::default());
        let (_node, mut node_rx) = r.hub.join(NodeId(8));
        r.gw.on_serial_line(
            r#"{"type":"command","command":"restart_node","target_node":8}"#,
            Instant::now(),
        );
        let Some(MeshEvent::Received { payload, .. }) = node_rx.recv().await else {
            panic!("no command relayed");
        };
        let Envelope::Command(cmd) = Envelope::parse(&payload).unwrap() else {
            panic!("expected command");
        };
        assert_eq!(cmd.command, "restart");
        assert_eq!(cmd.target_node, Some(NodeId(8)));
    }

    #[test]
    fn silent_node_times_out_after_two_windows() {
        let mut r = rig(&Config::default());
        let t0 = Instant::now();
        r.gw.on_mesh_payload(NodeId(5), r#"{"type":"heartbeat_response","device_name":"S5"}"#, t0);
        r.gw.heartbeat_tick(t0 + Duration::from_secs(31));
        assert!(drain_lines(&mut r.upstream).is_empty());
        r.gw.heartbeat_tick(t0 + Duration::from_secs(62));
        let sent = drain_lines(&mut r.upstream);
        let Envelope::NodeTimeout(t) = &sent[0] else {
            panic!("expected node_timeout");
        };
        assert_eq!(t.node_id, NodeId(5));
        assert_eq!(t.missed_heartbeats, 2);
        assert_eq!(t.device_name.as_deref(), Some("S5"));
    }

    #[test]
    fn new_connection_is_welcomed_and_reported() {
        let mut r = rig(&Config::default());
        let now = Instant::now();
        r.gw.on_mesh_event(MeshEvent::NewConnection(NodeId(9)), now);
        let sent = drain_lines(&mut r.upstream);
        assert!(matches!(sent[0], Envelope::NodeConnected(NodeConnected { node_id: NodeId(9), .. })));
        let status = r.gw.status(now);
        assert_eq!(status.active_nodes.len(), 1);
        assert_eq!(status.active_node_count, 1);
        assert_eq!(status.priority_limit, PRIORITY_LIMIT);
    }
}
