//! Sender node: sensor sampling, reading broadcast and the OTA receiver.
//!
//! Sensor reads and reading broadcasts are suspended while an OTA transfer is
//! in progress so chunk traffic gets the radio to itself.
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::{send_mesh, wait_shutdown, RunOutcome, ShutdownRx};
use crate::config::Config;
use crate::logutil::escape_log;
use crate::metrics;
use crate::ota::{FlashSink, OtaAction, Receiver};
use crate::protocol::{
    is_newer, now_millis, Command, DeviceRole, Envelope, HeartbeatResponse, OtaCheck, SensorData,
};
use crate::sensor::{SeismicSensor, SensorReading};
use crate::transport::{MeshEvent, MeshTransport, NodeId};

/// Identity a sender stamps on its readings.
#[derive(Debug, Clone)]
pub struct SenderIdentity {
    pub node_id: NodeId,
    pub device_name: String,
    pub access_token: String,
    pub fw_version: String,
}

/// Build the `sensor_data` line for one reading. Payloads over `limit` bytes
/// fall back to a minimal document without the device name and event list.
pub fn sensor_payload(identity: &SenderIdentity, reading: &SensorReading, limit: usize) -> String {
    let full = Envelope::SensorData(SensorData {
        node_id: Some(identity.node_id),
        device_name: Some(identity.device_name.clone()),
        access_token: Some(identity.access_token.clone()),
        timestamp: Some(now_millis()),
        fw_version: Some(identity.fw_version.clone()),
        role: Some(DeviceRole::Sender.as_key().to_string()),
        earthquake: Some(reading.to_earthquake(true)),
    });
    match full.to_line() {
        Ok(line) if line.len() <= limit => return line,
        Ok(line) => debug!("sensor payload {} bytes over {}, sending minimal form", line.len(), limit),
        Err(e) => warn!("sensor payload encode failed: {}", e),
    }
    let minimal = Envelope::SensorData(SensorData {
        node_id: Some(identity.node_id),
        access_token: Some(identity.access_token.clone()),
        earthquake: Some(reading.to_earthquake(false)),
        ..Default::default()
    });
    minimal.to_line().unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    pub readings: u64,
    pub broadcasts: u64,
    pub sensor_errors: u64,
    pub heartbeats_answered: u64,
}

pub struct SenderNode<M: MeshTransport, S: SeismicSensor, F: FlashSink> {
    identity: SenderIdentity,
    mesh: M,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    sensor: S,
    receiver: Receiver<F>,
    latest: Option<SensorReading>,
    read_interval: Duration,
    send_interval: Duration,
    ota_check_interval: Duration,
    payload_limit: usize,
    stats: SenderStats,
}

impl<M: MeshTransport, S: SeismicSensor, F: FlashSink> SenderNode<M, S, F> {
    pub fn new(
        config: &Config,
        mesh: M,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        sensor: S,
        sink: F,
    ) -> Self {
        // a committed update outranks the configured version
        let fw_version = match sink.stored_version() {
            Some(stored) if is_newer(&config.device.fw_version, &stored) => {
                info!("running committed firmware {} (configured {})", stored, config.device.fw_version);
                stored
            }
            _ => config.device.fw_version.clone(),
        };
        let identity = SenderIdentity {
            node_id: mesh.node_id(),
            device_name: config.device.name.clone(),
            access_token: config.device.access_token.clone(),
            fw_version,
        };
        let receiver = Receiver::new(
            identity.node_id,
            identity.device_name.clone(),
            identity.fw_version.clone(),
            sink,
            config.ota.receiver(),
        );
        Self {
            identity,
            mesh,
            events,
            sensor,
            receiver,
            latest: None,
            read_interval: Duration::from_millis(config.sender.read_interval_ms.max(1)),
            send_interval: Duration::from_millis(config.sender.send_interval_ms.max(1)),
            ota_check_interval: Duration::from_secs(config.sender.ota_check_interval_secs),
            payload_limit: config.sender.max_payload_bytes,
            stats: SenderStats::default(),
        }
    }

    pub fn identity(&self) -> &SenderIdentity {
        &self.identity
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn receiver(&self) -> &Receiver<F> {
        &self.receiver
    }

    pub fn latest(&self) -> Option<&SensorReading> {
        self.latest.as_ref()
    }

    /// Broadcast `ota_check` with the running version.
    pub fn announce_version(&mut self) {
        let check = Envelope::OtaCheck(OtaCheck {
            role: DeviceRole::Sender.as_key().to_string(),
            fw_version: self.receiver.current_version().to_string(),
            source_node: Some(self.identity.node_id),
        });
        info!(
            "announcing {} {}",
            DeviceRole::Sender,
            self.receiver.current_version()
        );
        send_mesh(&mut self.mesh, None, &check);
    }

    pub fn read_sensor(&mut self) {
        if self.receiver.is_busy() {
            return;
        }
        match self.sensor.read() {
            Ok(reading) => {
                self.stats.readings += 1;
                self.latest = Some(reading);
            }
            Err(e) => {
                self.stats.sensor_errors += 1;
                warn!("sensor read failed: {}", e);
            }
        }
    }

    pub fn broadcast_reading(&mut self) {
        if self.receiver.is_busy() {
            return;
        }
        let Some(reading) = self.latest else {
            return;
        };
        let line = sensor_payload(&self.identity, &reading, self.payload_limit);
        if line.is_empty() {
            return;
        }
        if super::send_mesh_raw(&mut self.mesh, None, &line) {
            self.stats.broadcasts += 1;
        }
    }

    /// Handle one transport event. Returns `Some` when the device must restart.
    pub fn on_event(&mut self, event: MeshEvent, now: Instant) -> Option<RunOutcome> {
        match event {
            MeshEvent::Received { from, payload } => self.on_payload(from, &payload, now),
            MeshEvent::NewConnection(id) => {
                debug!("mesh peer {} connected", id);
                None
            }
            MeshEvent::TopologyChanged => None,
        }
    }

    pub fn on_payload(&mut self, from: NodeId, raw: &str, now: Instant) -> Option<RunOutcome> {
        metrics::inc_envelopes_received();
        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(e) => {
                metrics::inc_envelopes_malformed();
                debug!("dropping malformed payload from {}: {} ({})", from, escape_log(raw), e);
                return None;
            }
        };
        match &envelope {
            Envelope::HeartbeatRequest(_) => {
                let reply = Envelope::HeartbeatResponse(HeartbeatResponse {
                    source_node: Some(self.identity.node_id),
                    device_name: Some(self.identity.device_name.clone()),
                    fw_version: Some(self.receiver.current_version().to_string()),
                });
                if send_mesh(&mut self.mesh, Some(from), &reply) {
                    self.stats.heartbeats_answered += 1;
                }
                None
            }
            Envelope::Command(cmd) => self.on_command(cmd),
            Envelope::Welcome(w) => {
                info!("welcomed by gateway {} ({})", w.gateway_id, w.version);
                None
            }
            env if env.is_ota_transfer() => {
                let actions = self.receiver.handle(from, env, now);
                self.apply(actions)
            }
            _ => None,
        }
    }

    fn on_command(&mut self, cmd: &Command) -> Option<RunOutcome> {
        if cmd
            .target_node
            .is_some_and(|t| !t.is_unspecified() && t != self.identity.node_id)
        {
            return None;
        }
        match cmd.command.as_str() {
            "restart" => {
                info!("restart requested by gateway {:?}", cmd.from_gateway);
                Some(RunOutcome::Restart {
                    reason: "remote_command".into(),
                })
            }
            other => {
                debug!("ignoring command {}", other);
                None
            }
        }
    }

    pub fn check_ota_timeout(&mut self, now: Instant) -> Option<RunOutcome> {
        let actions = self.receiver.check_timeout(now);
        self.apply(actions)
    }

    fn apply(&mut self, actions: Vec<OtaAction>) -> Option<RunOutcome> {
        let mut outcome = None;
        for action in actions {
            match action {
                OtaAction::Send { to, envelope } => {
                    send_mesh(&mut self.mesh, to, &envelope);
                }
                OtaAction::Closed(o) => {
                    info!(
                        target: "ota",
                        "session {} closed: {} ({}/{} bytes)",
                        o.version, o.message, o.bytes_transferred, o.total_size
                    );
                }
                OtaAction::Restart { reason } => {
                    outcome = Some(RunOutcome::Restart { reason });
                }
            }
        }
        outcome
    }

    pub async fn run(mut self, mut shutdown: ShutdownRx) -> Result<RunOutcome> {
        info!(
            "sender {} ({}) running firmware {}",
            self.identity.node_id, self.identity.device_name, self.identity.fw_version
        );
        self.announce_version();

        let mut read_tick = interval(self.read_interval);
        read_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut send_tick = interval(self.send_interval);
        send_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ota_tick = interval(Duration::from_secs(1));
        ota_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let announce_every = if self.ota_check_interval.is_zero() {
            None
        } else {
            Some(self.ota_check_interval)
        };
        let mut last_announce = Instant::now();

        loop {
            tokio::select! {
                _ = read_tick.tick() => self.read_sensor(),
                _ = send_tick.tick() => self.broadcast_reading(),
                _ = ota_tick.tick() => {
                    let now = Instant::now();
                    if let Some(outcome) = self.check_ota_timeout(now) {
                        return Ok(outcome);
                    }
                    if announce_every.is_some_and(|every| now.duration_since(last_announce) >= every)
                        && !self.receiver.is_busy()
                    {
                        self.announce_version();
                        last_announce = now;
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        warn!("mesh adapter closed");
                        return Ok(RunOutcome::Shutdown);
                    };
                    if let Some(outcome) = self.on_event(event, Instant::now()) {
                        return Ok(outcome);
                    }
                }
                _ = wait_shutdown(&mut shutdown) => {
                    info!("sender {} shutting down", self.identity.node_id);
                    return Ok(RunOutcome::Shutdown);
                }
            }
        }
    }
}
