//! # Node Health Tracking
//!
//! [`NodeRegistry`] keeps one [`NodeRecord`] per peer ever observed. Records
//! are never deleted; a node that goes quiet is retired by flipping it
//! inactive/offline, and comes back on its next message.
//!
//! Two liveness policies share the registry:
//!
//! - missed heartbeats (mesh gateway): every heartbeat tick, a node silent
//!   for longer than the window gains a miss; at the miss limit it becomes
//!   inactive and a timeout is reported once
//! - presence sweep (WiFi gateway): a node silent longer than the offline
//!   window flips to offline
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::transport::NodeId;

/// Heartbeat window on the mesh side.
pub const NODE_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive missed windows before a node is marked inactive.
pub const MAX_MISSED_HEARTBEATS: u32 = 2;
/// Silence after which the WiFi gateway shows a node offline.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Updating,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub si: f64,
    pub pga: f64,
    pub temp: f64,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub firmware_version: Option<String>,
    pub auth_token: Option<String>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub is_active: bool,
    pub is_high_priority: bool,
    pub total_messages: u64,
    pub latest: Option<SensorSnapshot>,
    pub status: NodeStatus,
}

impl NodeRecord {
    fn new(node_id: NodeId, now: Instant) -> Self {
        Self {
            node_id,
            display_name: None,
            role: None,
            firmware_version: None,
            auth_token: None,
            first_seen: now,
            last_seen: now,
            last_seen_at: Utc::now(),
            missed_heartbeats: 0,
            is_active: true,
            is_high_priority: false,
            total_messages: 0,
            latest: None,
            status: NodeStatus::Online,
        }
    }

    fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_at = Utc::now();
        self.missed_heartbeats = 0;
        self.is_active = true;
        if self.status == NodeStatus::Offline {
            self.status = NodeStatus::Online;
        }
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Serializable view of a record for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub device_name: Option<String>,
    pub role: Option<String>,
    pub fw_version: Option<String>,
    pub status: NodeStatus,
    pub active: bool,
    pub high_priority: bool,
    pub message_count: u64,
    pub missed_heartbeats: u32,
    pub last_seen: DateTime<Utc>,
    pub last_seen_secs_ago: u64,
    pub uptime_secs: u64,
    pub latest: Option<SensorSnapshot>,
}

/// A node that just crossed the missed-heartbeat limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTimeout {
    pub node_id: NodeId,
    pub missed: u32,
    pub display_name: Option<String>,
}

/// Identity fields carried by sensor and status envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity<'a> {
    pub display_name: Option<&'a str>,
    pub role: Option<&'a str>,
    pub firmware_version: Option<&'a str>,
    pub auth_token: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|r| r.is_active).count()
    }

    pub fn online_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|r| r.status != NodeStatus::Offline)
            .count()
    }

    /// Refresh liveness without counting a message (connection events).
    pub fn touch(&mut self, node: NodeId, now: Instant) -> &mut NodeRecord {
        let record = self.nodes.entry(node).or_insert_with(|| {
            info!("tracking new node {}", node);
            NodeRecord::new(node, now)
        });
        record.refresh(now);
        record
    }

    /// Any inbound traffic from `node`. Latches the priority flag of the
    /// most recent message.
    pub fn record_message(&mut self, node: NodeId, high_priority: bool, now: Instant) -> &mut NodeRecord {
        let record = self.touch(node, now);
        record.total_messages += 1;
        record.is_high_priority = high_priority;
        record
    }

    pub fn update_identity(&mut self, node: NodeId, identity: Identity<'_>) {
        let Some(r) = self.nodes.get_mut(&node) else {
            return;
        };
        fn set(slot: &mut Option<String>, value: Option<&str>) {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                *slot = Some(v.to_string());
            }
        }
        set(&mut r.display_name, identity.display_name);
        set(&mut r.role, identity.role);
        set(&mut r.firmware_version, identity.firmware_version);
        set(&mut r.auth_token, identity.auth_token);
    }

    pub fn update_reading(&mut self, node: NodeId, snapshot: SensorSnapshot) {
        if let Some(r) = self.nodes.get_mut(&node) {
            r.latest = Some(snapshot);
        }
    }

    pub fn set_status(&mut self, node: NodeId, status: NodeStatus) {
        if let Some(r) = self.nodes.get_mut(&node) {
            r.status = status;
        }
    }

    /// Retire a node; returns true when it was active.
    pub fn mark_inactive(&mut self, node: NodeId) -> bool {
        match self.nodes.get_mut(&node) {
            Some(r) if r.is_active => {
                r.is_active = false;
                r.status = NodeStatus::Offline;
                true
            }
            _ => false,
        }
    }

    /// After a topology change: retire every active node missing from the
    /// transport roster. Returns the retired ids.
    pub fn reconcile_roster(&mut self, reachable: &[NodeId]) -> Vec<NodeId> {
        let gone: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|r| r.is_active && !reachable.contains(&r.node_id))
            .map(|r| r.node_id)
            .collect();
        for id in &gone {
            self.mark_inactive(*id);
            debug!("node {} left the mesh", id);
        }
        gone
    }

    /// Missed-heartbeat escalation. Each call is one heartbeat window.
    pub fn check_heartbeats(&mut self, now: Instant, window: Duration, max_missed: u32) -> Vec<HeartbeatTimeout> {
        let mut timed_out = Vec::new();
        for r in self.nodes.values_mut().filter(|r| r.is_active) {
            if r.silent_for(now) <= window {
                continue;
            }
            r.missed_heartbeats += 1;
            debug!("node {} missed heartbeat {}", r.node_id, r.missed_heartbeats);
            if r.missed_heartbeats >= max_missed {
                r.is_active = false;
                r.status = NodeStatus::Offline;
                info!(
                    "node {} inactive after {} missed heartbeats",
                    r.node_id, r.missed_heartbeats
                );
                timed_out.push(HeartbeatTimeout {
                    node_id: r.node_id,
                    missed: r.missed_heartbeats,
                    display_name: r.display_name.clone(),
                });
            }
        }
        timed_out
    }

    /// Presence sweep. Nodes mid-update are left alone.
    pub fn sweep_presence(&mut self, now: Instant, offline_after: Duration) -> Vec<NodeId> {
        let mut flipped = Vec::new();
        for r in self.nodes.values_mut() {
            if r.status == NodeStatus::Online && r.silent_for(now) > offline_after {
                r.status = NodeStatus::Offline;
                r.is_active = false;
                flipped.push(r.node_id);
            }
        }
        if !flipped.is_empty() {
            debug!("{} node(s) went offline", flipped.len());
        }
        flipped
    }

    pub fn view(&self, now: Instant) -> Vec<NodeView> {
        self.nodes
            .values()
            .map(|r| NodeView {
                node_id: r.node_id,
                device_name: r.display_name.clone(),
                role: r.role.clone(),
                fw_version: r.firmware_version.clone(),
                status: r.status,
                active: r.is_active,
                high_priority: r.is_high_priority,
                message_count: r.total_messages,
                missed_heartbeats: r.missed_heartbeats,
                last_seen: r.last_seen_at,
                last_seen_secs_ago: r.silent_for(now).as_secs(),
                uptime_secs: r.last_seen.saturating_duration_since(r.first_seen).as_secs(),
                latest: r.latest,
            })
            .collect()
    }
}
