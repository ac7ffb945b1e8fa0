//! # Transport Adapters
//!
//! The relay core never talks to radios or UARTs directly. It consumes two
//! capabilities:
//!
//! - [`MeshTransport`]: the self-organizing wireless mesh (broadcast, unicast,
//!   live roster). Inbound traffic is delivered as [`MeshEvent`]s over a channel.
//! - [`SerialLink`]: the point-to-point newline-delimited JSON link between the
//!   mesh gateway and the WiFi gateway. Inbound lines are delivered over a channel.
//!
//! Concrete adapters:
//!
//! - [`memory`] - in-process hub used by tests and the `simulate` command
//! - [`line`] - newline framing shared by every serial implementation
//! - [`serial`] - `serialport` backed link (feature `serial`)
//! - [`udp`] - JSON datagrams over LAN broadcast, standing in for a mesh radio

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::QuakeResult;

pub mod line;
pub mod memory;
#[cfg(feature = "serial")]
pub mod serial;
pub mod udp;

/// Mesh node identifier (32-bit, assigned by the mesh transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    /// `0` is used on the wire for "no specific target".
    pub const UNSPECIFIED: NodeId = NodeId(0);

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        NodeId(v)
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(NodeId)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

// Peers emit node ids both as JSON numbers and as numeric strings.
impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => u32::try_from(n)
                .map(NodeId)
                .map_err(|_| serde::de::Error::custom(format!("node id out of range: {n}"))),
            Raw::Str(s) => s
                .parse::<NodeId>()
                .map_err(|_| serde::de::Error::custom(format!("invalid node id: {s:?}"))),
        }
    }
}

/// Serialize a node id as a decimal string (wire format for `target_node`).
pub fn node_id_as_string<S: Serializer>(id: &NodeId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&id.0.to_string())
}

/// Events produced by a mesh transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A payload arrived from a peer.
    Received { from: NodeId, payload: String },
    /// A peer joined the mesh.
    NewConnection(NodeId),
    /// The roster changed; query [`MeshTransport::reachable_nodes`] for the new set.
    TopologyChanged,
}

/// Capability exposed by the wireless mesh.
pub trait MeshTransport: Send {
    /// Our own node id.
    fn node_id(&self) -> NodeId;
    /// Send to every reachable node.
    fn send_broadcast(&mut self, payload: &str) -> QuakeResult<()>;
    /// Send to one node.
    fn send_single(&mut self, to: NodeId, payload: &str) -> QuakeResult<()>;
    /// Currently reachable nodes (excluding ourselves).
    fn reachable_nodes(&self) -> Vec<NodeId>;
}

/// Point-to-point newline-delimited JSON link.
pub trait SerialLink: Send {
    /// Write one envelope as one line. Implementations chunk long payloads
    /// (see [`line::frame_line`]) and flush before returning.
    fn send_line(&mut self, line: &str) -> QuakeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_accepts_number_and_string() {
        let a: NodeId = serde_json::from_str("123456").unwrap();
        let b: NodeId = serde_json::from_str("\"123456\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, NodeId(123456));
        assert!(serde_json::from_str::<NodeId>("\"abc\"").is_err());
        assert!(serde_json::from_str::<NodeId>("99999999999").is_err());
    }
}
