//! # Envelope Codec
//!
//! Every message exchanged between the three device roles is a flat JSON object
//! carrying a `type` string. [`Envelope`] decodes the tag first and dispatches
//! to one strongly typed payload struct per message kind; unknown tags decode to
//! [`Envelope::Unknown`] and are ignored by every role.
//!
//! Field conventions shared by all payloads:
//!
//! - routing: `source_node`, `target_node`, `gateway_id` (node ids accept JSON
//!   numbers or numeric strings; `target_node` is emitted as a string)
//! - identity: `device_name`, `access_token`, `fw_version`, `role`
//! - seismic readings: `si`, `pga`, `temp`
//!
//! Two raw-text helpers ([`is_ota_line`], [`quick_target_node`]) inspect a line
//! before JSON parsing; the mesh gateway uses them to forward OTA traffic
//! without touching the relay queues.

use serde::{Deserialize, Serialize, Serializer};

use crate::errors::QuakeResult;
use crate::transport::{node_id_as_string, NodeId};

pub mod version;

pub use version::{is_newer, FirmwareVersion};

/// Default OTA chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 512;

/// Milliseconds since the Unix epoch, used for envelope timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Device role inside the three-tier relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceRole {
    /// Seismic sensor node on the mesh.
    Sender,
    /// Bridges the mesh to the serial link.
    MeshGateway,
    /// Bridges the serial link to the cloud; OTA distribution authority.
    WifiGateway,
}

impl DeviceRole {
    /// Role key used on the wire and as the manifest asset key.
    pub fn as_key(&self) -> &'static str {
        match self {
            DeviceRole::Sender => "ROLE_SENDER_NODE",
            DeviceRole::MeshGateway => "ROLE_MESH_GATEWAY",
            DeviceRole::WifiGateway => "ROLE_WIFI_GATEWAY",
        }
    }

    pub fn from_key(key: &str) -> Option<DeviceRole> {
        match key {
            "ROLE_SENDER_NODE" => Some(DeviceRole::Sender),
            "ROLE_MESH_GATEWAY" => Some(DeviceRole::MeshGateway),
            "ROLE_WIFI_GATEWAY" => Some(DeviceRole::WifiGateway),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

fn opt_node_id_as_string<S: Serializer>(id: &Option<NodeId>, s: S) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => node_id_as_string(id, s),
        None => s.serialize_none(),
    }
}

fn default_chunk() -> u32 {
    DEFAULT_CHUNK_SIZE
}

/// One significant seismic event block reported by a sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeismicEvent {
    pub id: u8,
    pub si: f64,
    pub pga: f64,
    pub temp: f64,
}

impl SeismicEvent {
    /// Events are reported only when they exceed the intensity or acceleration floor.
    pub fn is_significant(&self) -> bool {
        self.si > 5.0 || self.pga > 10.0
    }
}

/// Latest sensor snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EarthquakeReading {
    /// `active` when the sensor initialised, else `offline`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub si: f64,
    #[serde(default)]
    pub pga: f64,
    #[serde(default)]
    pub temp: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SeismicEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earthquake: Option<EarthquakeReading>,
}

/// Relay priority label carried in `mesh_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLabel {
    High,
    Normal,
}

/// Sensor reading wrapped by the mesh gateway for the upstream hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub source_node: NodeId,
    pub gateway_id: NodeId,
    #[serde(default)]
    pub timestamp: i64,
    pub priority: PriorityLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    pub data: SensorData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaCheck {
    #[serde(default)]
    pub role: String,
    #[serde(default, alias = "fw")]
    pub fw_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaCheckForward {
    pub source_node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<NodeId>,
    #[serde(default)]
    pub role: String,
    #[serde(default, alias = "fw")]
    pub fw_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaOffer {
    #[serde(serialize_with = "node_id_as_string")]
    pub target_node: NodeId,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default = "default_chunk")]
    pub chunk: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaAccept {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaNext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
    pub idx: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaChunk {
    #[serde(serialize_with = "node_id_as_string")]
    pub target_node: NodeId,
    pub idx: u32,
    /// Base64 (standard alphabet, padded) chunk bytes.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaEnd {
    #[serde(serialize_with = "node_id_as_string")]
    pub target_node: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
    pub ok: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaAbort {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "opt_node_id_as_string"
    )]
    pub target_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub gateway_id: NodeId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnected {
    pub node_id: NodeId,
    pub gateway_id: NodeId,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDisconnected {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<NodeId>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTimeout {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<NodeId>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub missed_heartbeats: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStartup {
    pub gateway_id: NodeId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// One tracked node as listed in `mesh_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNodeSummary {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub high_priority: bool,
    #[serde(default)]
    pub idle_ms: u64,
}

/// One OTA pass-through as listed in `mesh_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySessionSummary {
    pub target_node: NodeId,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub chunks_forwarded: u32,
    #[serde(default)]
    pub bytes_forwarded: u64,
    #[serde(default)]
    pub idle_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshStatus {
    pub gateway_id: NodeId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub connected_nodes: usize,
    #[serde(default)]
    pub total_messages_received: u64,
    #[serde(default)]
    pub total_messages_sent: u64,
    #[serde(default)]
    pub total_batches_processed: u64,
    #[serde(default)]
    pub dropped_messages: u64,
    #[serde(default)]
    pub queued_messages: usize,
    #[serde(default)]
    pub priority_messages: usize,
    #[serde(default)]
    pub priority_limit: usize,
    #[serde(default)]
    pub active_node_count: usize,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub active_nodes: Vec<MeshNodeSummary>,
    #[serde(default)]
    pub ota_relays: Vec<RelaySessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub gateway_id: NodeId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_gateway: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Every message understood by the relay, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    SensorData(SensorData),
    MeshData(MeshData),
    OtaCheck(OtaCheck),
    OtaCheckForward(OtaCheckForward),
    OtaOffer(OtaOffer),
    OtaAccept(OtaAccept),
    OtaNext(OtaNext),
    OtaChunk(OtaChunk),
    OtaEnd(OtaEnd),
    OtaResult(OtaResult),
    OtaAbort(OtaAbort),
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
    NodeStatus(NodeStatusReport),
    NodeConnected(NodeConnected),
    NodeDisconnected(NodeDisconnected),
    NodeTimeout(NodeTimeout),
    GatewayStartup(GatewayStartup),
    MeshStatus(MeshStatus),
    Welcome(Welcome),
    Command(Command),
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Decode one line of JSON text.
    pub fn parse(raw: &str) -> QuakeResult<Envelope> {
        Ok(serde_json::from_str(raw.trim())?)
    }

    /// Encode as one line of JSON text (no trailing newline).
    pub fn to_line(&self) -> QuakeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::SensorData(_) => "sensor_data",
            Envelope::MeshData(_) => "mesh_data",
            Envelope::OtaCheck(_) => "ota_check",
            Envelope::OtaCheckForward(_) => "ota_check_forward",
            Envelope::OtaOffer(_) => "ota_offer",
            Envelope::OtaAccept(_) => "ota_accept",
            Envelope::OtaNext(_) => "ota_next",
            Envelope::OtaChunk(_) => "ota_chunk",
            Envelope::OtaEnd(_) => "ota_end",
            Envelope::OtaResult(_) => "ota_result",
            Envelope::OtaAbort(_) => "ota_abort",
            Envelope::HeartbeatRequest(_) => "heartbeat_request",
            Envelope::HeartbeatResponse(_) => "heartbeat_response",
            Envelope::NodeStatus(_) => "node_status",
            Envelope::NodeConnected(_) => "node_connected",
            Envelope::NodeDisconnected(_) => "node_disconnected",
            Envelope::NodeTimeout(_) => "node_timeout",
            Envelope::GatewayStartup(_) => "gateway_startup",
            Envelope::MeshStatus(_) => "mesh_status",
            Envelope::Welcome(_) => "welcome",
            Envelope::Command(_) => "command",
            Envelope::Unknown => "unknown",
        }
    }

    /// True for the transfer messages (`ota_offer` .. `ota_abort`), which travel
    /// outside the relay queues. `ota_check` is a plain announcement.
    pub fn is_ota_transfer(&self) -> bool {
        matches!(
            self,
            Envelope::OtaOffer(_)
                | Envelope::OtaAccept(_)
                | Envelope::OtaNext(_)
                | Envelope::OtaChunk(_)
                | Envelope::OtaEnd(_)
                | Envelope::OtaResult(_)
                | Envelope::OtaAbort(_)
        )
    }
}

fn skip_ws(s: &str) -> &str {
    s.trim_start_matches(|c: char| c.is_ascii_whitespace())
}

/// Text following `"key"` and its colon, or `None` when the key is absent.
fn value_after_key<'a>(raw: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\"");
    let mut search = raw;
    while let Some(pos) = search.find(&needle) {
        let rest = skip_ws(&search[pos + needle.len()..]);
        if let Some(value) = rest.strip_prefix(':') {
            return Some(skip_ws(value));
        }
        search = &search[pos + needle.len()..];
    }
    None
}

/// Raw-text check for an OTA envelope: a `"type"` key whose string value starts
/// with `ota_`. Runs before (and independently of) JSON parsing.
pub fn is_ota_line(raw: &str) -> bool {
    value_after_key(raw, "type")
        .and_then(|v| v.strip_prefix('"'))
        .is_some_and(|v| v.starts_with("ota_"))
}

/// Raw-text extraction of `target_node`, accepting a quoted or bare number.
pub fn quick_target_node(raw: &str) -> Option<NodeId> {
    let value = value_after_key(raw, "target_node")?;
    let value = value.strip_prefix('"').unwrap_or(value);
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u32>().ok().map(NodeId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_emits_target_as_string() {
        let offer = Envelope::OtaOffer(OtaOffer {
            target_node: NodeId(42),
            version: "2.2.0".into(),
            size: 2048,
            chunk: 512,
        });
        let line = offer.to_line().unwrap();
        assert!(line.contains("\"type\":\"ota_offer\""));
        assert!(line.contains("\"target_node\":\"42\""));
        assert_eq!(Envelope::parse(&line).unwrap(), offer);
    }

    #[test]
    fn offer_defaults_chunk_size() {
        let env = Envelope::parse(r#"{"type":"ota_offer","target_node":7,"version":"1.0.0","size":10}"#)
            .unwrap();
        match env {
            Envelope::OtaOffer(o) => {
                assert_eq!(o.chunk, DEFAULT_CHUNK_SIZE);
                assert_eq!(o.target_node, NodeId(7));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let env = Envelope::parse(r#"{"type":"display_refresh","x":1}"#).unwrap();
        assert_eq!(env, Envelope::Unknown);
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"no_type":1}"#).is_err());
    }

    #[test]
    fn ota_check_accepts_fw_alias() {
        let env = Envelope::parse(r#"{"type":"ota_check","role":"ROLE_SENDER_NODE","fw":"2.1.0"}"#)
            .unwrap();
        assert_eq!(
            env,
            Envelope::OtaCheck(OtaCheck {
                role: "ROLE_SENDER_NODE".into(),
                fw_version: "2.1.0".into(),
                source_node: None,
            })
        );
    }

    #[test]
    fn sensor_data_round_trips_nested_reading() {
        let raw = r#"{"type":"sensor_data","node_id":5,"device_name":"S1","access_token":"tok",
            "earthquake":{"status":"active","si":12,"pga":3,"temp":24.5,
            "events":[{"id":1,"si":12,"pga":3,"temp":24.5}]}}"#;
        let Envelope::SensorData(data) = Envelope::parse(raw).unwrap() else {
            panic!("expected sensor_data");
        };
        let eq = data.earthquake.unwrap();
        assert_eq!(eq.si, 12.0);
        assert_eq!(eq.events.len(), 1);
        assert!(eq.events[0].is_significant());
    }

    #[test]
    fn raw_helpers() {
        assert!(is_ota_line(r#"{"type":"ota_chunk","target_node":"9","idx":0,"data":""}"#));
        assert!(is_ota_line(r#"{ "type" : "ota_end" }"#));
        assert!(!is_ota_line(r#"{"type":"sensor_data","note":"ota_x"}"#));
        assert!(!is_ota_line("garbage"));
        assert_eq!(
            quick_target_node(r#"{"type":"ota_end","target_node":"1234"}"#),
            Some(NodeId(1234))
        );
        assert_eq!(
            quick_target_node(r#"{"target_node": 77,"type":"ota_end"}"#),
            Some(NodeId(77))
        );
        assert_eq!(quick_target_node(r#"{"type":"ota_end"}"#), None);
    }

    #[test]
    fn role_keys() {
        for role in [DeviceRole::Sender, DeviceRole::MeshGateway, DeviceRole::WifiGateway] {
            assert_eq!(DeviceRole::from_key(role.as_key()), Some(role));
        }
        assert_eq!(DeviceRole::from_key("ROLE_TOASTER"), None);
    }
}
