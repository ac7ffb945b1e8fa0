//! In-process transports.
//!
//! [`MemoryHub`] is a fully connected mesh where every joined node can reach
//! every other node; [`memory_link_pair`] returns the two ends of a serial link.
//! Both deliver inbound traffic over tokio unbounded channels, exactly like the
//! hardware adapters, so role loops run unchanged on top of them.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::trace;
use tokio::sync::mpsc;

use super::{MeshEvent, MeshTransport, NodeId, SerialLink};
use crate::errors::{QuakeError, QuakeResult};

#[derive(Default)]
struct HubInner {
    members: BTreeMap<NodeId, mpsc::UnboundedSender<MeshEvent>>,
}

/// Shared fully connected mesh.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the mesh as `id`. Existing members observe a new connection.
    pub fn join(&self, id: NodeId) -> (MemoryMesh, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut guard) = self.inner.lock() {
            for sender in guard.members.values() {
                let _ = sender.send(MeshEvent::NewConnection(id));
            }
            guard.members.insert(id, tx);
        }
        (
            MemoryMesh {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Remove `id` from the mesh. Remaining members observe a topology change.
    pub fn leave(&self, id: NodeId) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.members.remove(&id);
            for sender in guard.members.values() {
                let _ = sender.send(MeshEvent::TopologyChanged);
            }
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.inner
            .lock()
            .map(|g| g.members.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// One member's view of a [`MemoryHub`].
pub struct MemoryMesh {
    id: NodeId,
    hub: MemoryHub,
}

impl MeshTransport for MemoryMesh {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn send_broadcast(&mut self, payload: &str) -> QuakeResult<()> {
        let guard = self
            .hub
            .inner
            .lock()
            .map_err(|_| QuakeError::Transport("mesh hub poisoned".into()))?;
        for (member, sender) in guard.members.iter() {
            if *member == self.id {
                continue;
            }
            let _ = sender.send(MeshEvent::Received {
                from: self.id,
                payload: payload.to_string(),
            });
        }
        trace!("mesh {} broadcast {} bytes", self.id, payload.len());
        Ok(())
    }

    fn send_single(&mut self, to: NodeId, payload: &str) -> QuakeResult<()> {
        let guard = self
            .hub
            .inner
            .lock()
            .map_err(|_| QuakeError::Transport("mesh hub poisoned".into()))?;
        let sender = guard
            .members
            .get(&to)
            .ok_or_else(|| QuakeError::Transport(format!("node {to} unreachable")))?;
        sender
            .send(MeshEvent::Received {
                from: self.id,
                payload: payload.to_string(),
            })
            .map_err(|_| QuakeError::Transport(format!("node {to} receiver closed")))
    }

    fn reachable_nodes(&self) -> Vec<NodeId> {
        self.hub
            .members()
            .into_iter()
            .filter(|id| *id != self.id)
            .collect()
    }
}

/// One end of an in-process serial link.
pub struct MemoryLink {
    peer: mpsc::UnboundedSender<String>,
    sent: Arc<Mutex<u64>>,
}

impl MemoryLink {
    /// Number of lines written through this end.
    pub fn lines_sent(&self) -> u64 {
        self.sent.lock().map(|g| *g).unwrap_or(0)
    }
}

impl SerialLink for MemoryLink {
    fn send_line(&mut self, line: &str) -> QuakeResult<()> {
        self.peer
            .send(line.to_string())
            .map_err(|_| QuakeError::Transport("serial peer closed".into()))?;
        if let Ok(mut g) = self.sent.lock() {
            *g += 1;
        }
        Ok(())
    }
}

/// Create both ends of a link. Each end comes with the receiver of lines
/// written by the opposite end.
pub fn memory_link_pair() -> (
    (MemoryLink, mpsc::UnboundedReceiver<String>),
    (MemoryLink, mpsc::UnboundedReceiver<String>),
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (
            MemoryLink {
                peer: b_tx,
                sent: Arc::new(Mutex::new(0)),
            },
            a_rx,
        ),
        (
            MemoryLink {
                peer: a_tx,
                sent: Arc::new(Mutex::new(0)),
            },
            b_rx,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_broadcast_and_unicast() {
        let hub = MemoryHub::new();
        let (mut a, mut a_rx) = hub.join(NodeId(1));
        let (_b, mut b_rx) = hub.join(NodeId(2));
        assert_eq!(a_rx.recv().await, Some(MeshEvent::NewConnection(NodeId(2))));

        a.send_broadcast("hello").unwrap();
        assert_eq!(
            b_rx.recv().await,
            Some(MeshEvent::Received {
                from: NodeId(1),
                payload: "hello".into()
            })
        );
        assert!(a.send_single(NodeId(9), "x").is_err());
        assert_eq!(a.reachable_nodes(), vec![NodeId(2)]);

        hub.leave(NodeId(2));
        assert!(a.reachable_nodes().is_empty());
        assert_eq!(a_rx.recv().await, Some(MeshEvent::TopologyChanged));
    }

    #[tokio::test]
    async fn link_pair_crosses_lines() {
        let ((mut left, mut left_rx), (mut right, mut right_rx)) = memory_link_pair();
        left.send_line("{\"type\":\"a\"}").unwrap();
        right.send_line("{\"type\":\"b\"}").unwrap();
        assert_eq!(right_rx.recv().await.as_deref(), Some("{\"type\":\"a\"}"));
        assert_eq!(left_rx.recv().await.as_deref(), Some("{\"type\":\"b\"}"));
        assert_eq!(left.lines_sent(), 1);
    }
}
