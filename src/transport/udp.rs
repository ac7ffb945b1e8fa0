//! UDP mesh adapter.
//!
//! Stands in for a mesh radio on hosts that share a LAN segment. Every node
//! binds the same UDP port and exchanges small JSON datagrams:
//!
//! ```text
//! {"from":123,"to":456,"payload":"{...envelope...}"}   // unicast
//! {"from":123,"to":null,"payload":"{...}"}             // broadcast
//! {"from":123,"to":null,"payload":""}                  // presence beacon
//! ```
//!
//! Peers are discovered from received datagrams (beacons included) and dropped
//! from the roster after [`PEER_TIMEOUT`] of silence.
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{MeshEvent, MeshTransport, NodeId};
use crate::errors::{QuakeError, QuakeResult};

/// Silence after which a peer leaves the roster.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval between presence beacons.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct Datagram {
    from: u32,
    to: Option<u32>,
    payload: String,
}

type Roster = Arc<Mutex<HashMap<NodeId, (SocketAddr, Instant)>>>;

/// Mesh transport over LAN UDP broadcast.
pub struct UdpMesh {
    id: NodeId,
    socket: UdpSocket,
    broadcast: SocketAddr,
    roster: Roster,
}

impl UdpMesh {
    /// Bind `0.0.0.0:port`, start receive and beacon tasks.
    pub async fn bind(id: NodeId, port: u16) -> Result<(Self, mpsc::UnboundedReceiver<MeshEvent>)> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|e| anyhow!("Failed to bind UDP mesh port {}: {}", port, e))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let recv_socket = tokio::net::UdpSocket::from_std(socket.try_clone()?)?;
        let broadcast: SocketAddr = ([255, 255, 255, 255], port).into();
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(receive_loop(id, recv_socket, roster.clone(), tx.clone()));

        let beacon_socket = socket.try_clone()?;
        let beacon_roster = roster.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BEACON_INTERVAL);
            loop {
                tick.tick().await;
                let hello = Datagram {
                    from: id.0,
                    to: None,
                    payload: String::new(),
                };
                if let Ok(bytes) = serde_json::to_vec(&hello) {
                    let _ = beacon_socket.send_to(&bytes, broadcast);
                }
                let expired = expire_peers(&beacon_roster, Instant::now());
                if expired > 0 && tx.send(MeshEvent::TopologyChanged).is_err() {
                    break;
                }
            }
        });

        info!("UDP mesh node {} listening on port {}", id, port);
        Ok((
            UdpMesh {
                id,
                socket,
                broadcast,
                roster,
            },
            rx,
        ))
    }

    fn send_datagram(&self, to: Option<NodeId>, payload: &str, addr: SocketAddr) -> QuakeResult<()> {
        let dg = Datagram {
            from: self.id.0,
            to: to.map(|n| n.0),
            payload: payload.to_string(),
        };
        let bytes = serde_json::to_vec(&dg)?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }
}

fn expire_peers(roster: &Roster, now: Instant) -> usize {
    let Ok(mut guard) = roster.lock() else {
        return 0;
    };
    let before = guard.len();
    guard.retain(|_, (_, seen)| now.duration_since(*seen) < PEER_TIMEOUT);
    before - guard.len()
}

async fn receive_loop(
    me: NodeId,
    socket: tokio::net::UdpSocket,
    roster: Roster,
    tx: mpsc::UnboundedSender<MeshEvent>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("udp mesh receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };
        let dg: Datagram = match serde_json::from_slice(&buf[..n]) {
            Ok(d) => d,
            Err(e) => {
                trace!("udp mesh ignoring malformed datagram from {}: {}", addr, e);
                continue;
            }
        };
        let from = NodeId(dg.from);
        if from == me {
            continue;
        }
        let is_new = match roster.lock() {
            Ok(mut guard) => guard.insert(from, (addr, Instant::now())).is_none(),
            Err(_) => false,
        };
        if is_new {
            debug!("udp mesh discovered node {} at {}", from, addr);
            if tx.send(MeshEvent::NewConnection(from)).is_err() {
                return;
            }
        }
        if dg.payload.is_empty() {
            continue;
        }
        if dg.to.is_some_and(|t| t != me.0) {
            continue;
        }
        if tx
            .send(MeshEvent::Received {
                from,
                payload: dg.payload,
            })
            .is_err()
        {
            return;
        }
    }
}

impl MeshTransport for UdpMesh {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn send_broadcast(&mut self, payload: &str) -> QuakeResult<()> {
        self.send_datagram(None, payload, self.broadcast)
    }

    fn send_single(&mut self, to: NodeId, payload: &str) -> QuakeResult<()> {
        let addr = self
            .roster
            .lock()
            .map_err(|_| QuakeError::Transport("udp roster poisoned".into()))?
            .get(&to)
            .map(|(a, _)| *a);
        // Unknown peers still get a chance through the broadcast address.
        self.send_datagram(Some(to), payload, addr.unwrap_or(self.broadcast))
    }

    fn reachable_nodes(&self) -> Vec<NodeId> {
        self.roster
            .lock()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_drops_silent_peers() {
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
        let now = Instant::now();
        let addr: SocketAddr = ([127, 0, 0, 1], 5555).into();
        roster.lock().unwrap().insert(NodeId(1), (addr, now));
        assert_eq!(expire_peers(&roster, now + Duration::from_secs(5)), 0);
        assert_eq!(expire_peers(&roster, now + PEER_TIMEOUT + Duration::from_secs(1)), 1);
        assert!(roster.lock().unwrap().is_empty());
    }

    #[test]
    fn datagram_wire_shape() {
        let dg = Datagram {
            from: 7,
            to: None,
            payload: "{}".into(),
        };
        let s = serde_json::to_string(&dg).unwrap();
        assert_eq!(s, "{\"from\":7,\"to\":null,\"payload\":\"{}\"}");
    }
}
