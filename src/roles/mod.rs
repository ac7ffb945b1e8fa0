//! # Device Roles
//!
//! One run loop per device role. Each loop owns all of its state (registry,
//! queues, OTA engine) and is the only place that mutates it; timers, inbound
//! transport traffic, management commands and the shutdown signal are
//! multiplexed with `tokio::select!`.
//!
//! - [`sender::SenderNode`] - reads the sensor, broadcasts readings, receives OTA
//! - [`mesh_gateway::MeshGateway`] - mesh to serial bridge with admission control
//! - [`wifi_gateway::WifiGateway`] - serial to cloud bridge, OTA distributor
//!
//! A loop returns a [`RunOutcome`]; `Restart` is mapped by the binary to
//! [`RESTART_EXIT_CODE`] so a process supervisor brings the device back up.
use log::{debug, warn};
use tokio::sync::watch;

use crate::protocol::Envelope;
use crate::transport::{MeshTransport, NodeId, SerialLink};

pub mod mesh_gateway;
pub mod sender;
pub mod wifi_gateway;

pub use mesh_gateway::MeshGateway;
pub use sender::SenderNode;
pub use wifi_gateway::{GatewayHandle, GatewayStats, ManagementCommand, WifiGateway};

/// Exit status asking the supervisor to restart the device process.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Why a role loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    Restart { reason: String },
}

/// Shutdown signal shared by the role loops of one process.
pub type ShutdownRx = watch::Receiver<bool>;

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownRx) {
    watch::channel(false)
}

/// Resolves once shutdown has been requested (or the sender is gone).
pub async fn wait_shutdown(rx: &mut ShutdownRx) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Encode and write one envelope on the serial link. Send failures are
/// logged; the protocol's own retries cover lost lines.
pub(crate) fn send_upstream<L: SerialLink + ?Sized>(link: &mut L, envelope: &Envelope) -> bool {
    let line = match envelope.to_line() {
        Ok(l) => l,
        Err(e) => {
            warn!("failed to encode {}: {}", envelope.kind(), e);
            return false;
        }
    };
    match link.send_line(&line) {
        Ok(()) => {
            debug!("serial <- {}", envelope.kind());
            true
        }
        Err(e) => {
            warn!("serial send of {} failed: {}", envelope.kind(), e);
            false
        }
    }
}

/// Encode and send one envelope on the mesh, unicast when `to` is given.
pub(crate) fn send_mesh<M: MeshTransport + ?Sized>(mesh: &mut M, to: Option<NodeId>, envelope: &Envelope) -> bool {
    let line = match envelope.to_line() {
        Ok(l) => l,
        Err(e) => {
            warn!("failed to encode {}: {}", envelope.kind(), e);
            return false;
        }
    };
    send_mesh_raw(mesh, to, &line)
}

pub(crate) fn send_mesh_raw<M: MeshTransport + ?Sized>(mesh: &mut M, to: Option<NodeId>, raw: &str) -> bool {
    let result = match to {
        Some(node) if !node.is_unspecified() => mesh.send_single(node, raw),
        _ => mesh.send_broadcast(raw),
    };
    if let Err(e) = result {
        warn!("mesh send failed: {}", e);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let (tx, mut rx) = shutdown_channel();
        let waiter = tokio::spawn(async move {
            wait_shutdown(&mut rx).await;
        });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
