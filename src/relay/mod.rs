//! # Relay Queueing & Admission Control
//!
//! The mesh gateway keeps two FIFO queues in front of the serial link:
//!
//! - **priority**: emergency and seismic readings, drained completely on
//!   every pass
//! - **normal**: everything else, drained in bounded batches
//!
//! Admission runs on every inbound message. When the combined occupancy is
//! above the congestion threshold, anything that is not high priority is
//! dropped and counted. High-priority messages are always admitted.
//!
//! Classification looks at the raw text only (see [`classify`]) so it works
//! even for payloads that fail to parse.
use std::collections::VecDeque;
use std::time::Instant;

use log::debug;
use serde::Serialize;

use crate::metrics;
use crate::transport::NodeId;

/// Combined capacity both queues are measured against.
pub const QUEUE_CAPACITY: usize = 200;
/// Occupancy percentage above which normal traffic is refused.
pub const CONGESTION_THRESHOLD_PCT: usize = 70;
/// Normal messages forwarded per batch.
pub const BATCH_SIZE: usize = 5;
/// Nominal priority-queue share of the capacity, reported in `mesh_status`.
pub const PRIORITY_LIMIT: usize = 40;

const PRIORITY_MARKERS: [&str; 5] = ["earthquake", "emergency", "alert", "\"si\":", "\"pga\":"];

/// Priority class: 0 is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    High = 0,
    Normal = 1,
    Status = 2,
}

impl PriorityClass {
    pub fn is_high(&self) -> bool {
        matches!(self, PriorityClass::High)
    }
}

/// Raw-text classification: high priority when any trigger substring
/// appears anywhere in the payload.
pub fn classify(raw: &str) -> PriorityClass {
    if PRIORITY_MARKERS.iter().any(|m| raw.contains(m)) {
        PriorityClass::High
    } else {
        PriorityClass::Normal
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub payload: String,
    /// `NodeId::UNSPECIFIED` for "no specific target".
    pub target_node: NodeId,
    pub enqueued_at: Instant,
    pub priority: PriorityClass,
    pub retry_count: u8,
}

impl QueuedMessage {
    pub fn new(payload: String, priority: PriorityClass, now: Instant) -> Self {
        Self {
            payload,
            target_node: NodeId::UNSPECIFIED,
            enqueued_at: now,
            priority,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(PriorityClass),
    Dropped,
}

#[derive(Debug, Clone)]
pub struct RelayQueueConfig {
    pub capacity: usize,
    pub congestion_threshold_pct: usize,
    pub batch_size: usize,
}

impl Default for RelayQueueConfig {
    fn default() -> Self {
        Self {
            capacity: QUEUE_CAPACITY,
            congestion_threshold_pct: CONGESTION_THRESHOLD_PCT,
            batch_size: BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub admitted_priority: u64,
    pub admitted_normal: u64,
    pub dropped: u64,
    pub forwarded: u64,
    pub batches: u64,
    pub peak_depth: usize,
}

pub struct RelayQueue {
    priority: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    config: RelayQueueConfig,
    stats: RelayStats,
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::new(RelayQueueConfig::default())
    }
}

impl RelayQueue {
    pub fn new(config: RelayQueueConfig) -> Self {
        Self {
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            config,
            stats: RelayStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Combined occupancy as a percentage of capacity.
    pub fn occupancy_pct(&self) -> usize {
        if self.config.capacity == 0 {
            return 100;
        }
        self.len() * 100 / self.config.capacity
    }

    pub fn is_congested(&self) -> bool {
        self.len() * 100 > self.config.capacity * self.config.congestion_threshold_pct
    }

    /// Classify `payload` and apply admission control.
    pub fn offer(&mut self, payload: String, now: Instant) -> Admission {
        let class = classify(&payload);
        self.admit(QueuedMessage::new(payload, class, now))
    }

    /// Admission control for an already classified message. Lower classes
    /// (status reports) share the normal queue.
    pub fn admit(&mut self, msg: QueuedMessage) -> Admission {
        let class = msg.priority;
        if !class.is_high() && self.is_congested() {
            self.stats.dropped += 1;
            metrics::inc_relay_dropped();
            debug!(
                "relay congested ({}% of {}), dropping {:?} message",
                self.occupancy_pct(),
                self.config.capacity,
                class
            );
            return Admission::Dropped;
        }
        if class.is_high() {
            self.priority.push_back(msg);
            self.stats.admitted_priority += 1;
        } else {
            self.normal.push_back(msg);
            self.stats.admitted_normal += 1;
        }
        metrics::inc_relay_admitted(class.is_high());
        self.stats.peak_depth = self.stats.peak_depth.max(self.len());
        Admission::Admitted(class)
    }

    /// Everything in the priority queue, oldest first.
    pub fn drain_priority(&mut self) -> Vec<QueuedMessage> {
        let out: Vec<_> = self.priority.drain(..).collect();
        self.stats.forwarded += out.len() as u64;
        metrics::add_relay_forwarded(out.len() as u64);
        out
    }

    /// Up to one batch from the normal queue.
    pub fn drain_batch(&mut self) -> Vec<QueuedMessage> {
        let n = self.config.batch_size.min(self.normal.len());
        if n == 0 {
            return Vec::new();
        }
        let out: Vec<_> = self.normal.drain(..n).collect();
        self.stats.forwarded += out.len() as u64;
        self.stats.batches += 1;
        metrics::add_relay_forwarded(out.len() as u64);
        metrics::inc_relay_batches();
        out
    }

    /// One scheduling pass: the full priority queue, then one normal batch.
    pub fn drain_pass(&mut self) -> Vec<QueuedMessage> {
        let mut out = self.drain_priority();
        out.extend(self.drain_batch());
        out
    }
}
