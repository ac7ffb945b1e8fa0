//! # OTA Transfer Engine
//!
//! One protocol, three asymmetric parties:
//!
//! | [`OtaRole`] | Device | Engine |
//! |---|---|---|
//! | `Distributor` | WiFi gateway | [`distributor::Distributor`] sends offers and chunks |
//! | `Relay` | mesh gateway | [`relay::OtaRelay`] passes OTA lines through untouched |
//! | `Receiver` | sender node | [`receiver::Receiver`] writes chunks to a [`flash::FlashSink`] |
//!
//! The transfer is pull based: after `ota_accept` the distributor sends chunk
//! 0, and every further chunk is sent only in answer to an `ota_next{idx}`
//! from the receiver. Once `idx * chunk >= size` the distributor answers with
//! `ota_end`.
//!
//! Every session walks `Idle -> Offered -> Transferring -> (Completing |
//! Aborting | TimedOut) -> Idle`. Explicit aborts, the failure threshold and
//! stall timeouts all end in the engine's single `teardown` path, which frees
//! the image buffer or flash sink, removes the session and yields an
//! [`OtaAction::Closed`] outcome.
//!
//! Engines are plain state machines. They never touch a transport; they take
//! the current [`Instant`] as an argument and return [`OtaAction`]s for the
//! role loop to carry out.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::errors::{QuakeError, QuakeResult};
use crate::protocol::Envelope;
use crate::transport::NodeId;

pub mod distributor;
pub mod flash;
pub mod manifest;
pub mod receiver;
pub mod relay;

pub use distributor::{Distributor, DistributorConfig, SessionInfo};
pub use flash::{FileFlashSink, FlashSink, MemoryFlashSink};
pub use manifest::{FirmwareSource, HttpFirmwareSource, Manifest, ManifestCache, StaticFirmwareSource};
pub use receiver::{Receiver, ReceiverConfig};
pub use relay::{OtaRelay, RelayRoute};

/// Receiver gives up on a session after this long without a chunk.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
/// Distributor abandons a session after this long without activity.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(300);
/// Consecutive receiver failures that force a device restart.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Minimum spacing between automatic offers to one node.
pub const AUTO_OTA_COOLDOWN: Duration = Duration::from_secs(300);

/// Which side of the protocol an engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaRole {
    Distributor,
    Relay,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaPhase {
    Idle,
    Offered,
    Transferring,
    Completing,
    Aborting,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    None,
    TimedOut,
    Aborted,
    Completed,
}

impl TerminalReason {
    fn phase(self) -> OtaPhase {
        match self {
            TerminalReason::None => OtaPhase::Idle,
            TerminalReason::TimedOut => OtaPhase::TimedOut,
            TerminalReason::Aborted => OtaPhase::Aborting,
            TerminalReason::Completed => OtaPhase::Completing,
        }
    }
}

/// Progress counters common to every party.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub node_id: NodeId,
    pub version: String,
    pub total_size: u64,
    bytes_transferred: u64,
    pub current_chunk_index: u32,
    pub expected_digest: Option<String>,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub consecutive_failures: u32,
    pub is_auto: bool,
    pub phase: OtaPhase,
    pub terminal: TerminalReason,
}

impl SessionProgress {
    pub fn new(node_id: NodeId, version: impl Into<String>, total_size: u64, now: Instant) -> Self {
        Self {
            node_id,
            version: version.into(),
            total_size,
            bytes_transferred: 0,
            current_chunk_index: 0,
            expected_digest: None,
            started_at: now,
            last_activity: now,
            consecutive_failures: 0,
            is_auto: false,
            phase: OtaPhase::Offered,
            terminal: TerminalReason::None,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Raise the transferred count to `upto`, clamped to the total. Never
    /// decreases: a re-sent chunk leaves the count where it was.
    pub fn advance_to(&mut self, upto: u64) {
        let upto = upto.min(self.total_size);
        if upto > self.bytes_transferred {
            self.bytes_transferred = upto;
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn progress_percent(&self) -> u8 {
        if self.total_size == 0 {
            return 0;
        }
        ((self.bytes_transferred * 100) / self.total_size).min(100) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total_size > 0 && self.bytes_transferred == self.total_size
    }

    fn terminate(&mut self, reason: TerminalReason) {
        self.terminal = reason;
        self.phase = reason.phase();
    }
}

/// Gives [`SessionTable`] access to the progress counters of a session.
pub trait Tracked {
    fn progress(&self) -> &SessionProgress;
    fn progress_mut(&mut self) -> &mut SessionProgress;
}

/// Sessions keyed by node id, at most one per node.
#[derive(Debug)]
pub struct SessionTable<T> {
    sessions: BTreeMap<NodeId, T>,
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        Self {
            sessions: BTreeMap::new(),
        }
    }
}

impl<T: Tracked> SessionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session; refused while one is already active for the node.
    pub fn open(&mut self, node: NodeId, session: T) -> QuakeResult<&mut T> {
        if self.sessions.contains_key(&node) {
            return Err(QuakeError::SessionActive(node));
        }
        Ok(self.sessions.entry(node).or_insert(session))
    }

    /// Open a session, replacing (and returning) any existing one.
    pub fn replace(&mut self, node: NodeId, session: T) -> Option<T> {
        self.sessions.insert(node, session)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.sessions.contains_key(&node)
    }

    pub fn get(&self, node: NodeId) -> Option<&T> {
        self.sessions.get(&node)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut T> {
        self.sessions.get_mut(&node)
    }

    /// Remove a session, stamping why it ended.
    pub fn close(&mut self, node: NodeId, reason: TerminalReason) -> Option<T> {
        let mut session = self.sessions.remove(&node)?;
        session.progress_mut().terminate(reason);
        Some(session)
    }

    /// Nodes whose session has been idle for longer than `limit`.
    pub fn stalled(&self, now: Instant, limit: Duration) -> Vec<NodeId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.progress().idle_for(now) > limit)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &T)> {
        self.sessions.iter()
    }
}

/// How a session ended, as reported to the role loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub node_id: NodeId,
    pub reason: TerminalReason,
    pub ok: bool,
    pub version: String,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub message: String,
}

impl SessionOutcome {
    fn from_progress(p: &SessionProgress, ok: bool, message: impl Into<String>) -> Self {
        Self {
            node_id: p.node_id,
            reason: p.terminal,
            ok,
            version: p.version.clone(),
            bytes_transferred: p.bytes_transferred,
            total_size: p.total_size,
            message: message.into(),
        }
    }
}

/// Side effects requested by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum OtaAction {
    /// Send an envelope to the peer. `to` names the remote node when the
    /// transport needs one.
    Send { to: Option<NodeId>, envelope: Envelope },
    /// Restart the device (receiver only).
    Restart { reason: String },
    /// A session was torn down.
    Closed(SessionOutcome),
}

impl OtaAction {
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            OtaAction::Send { envelope, .. } => Some(envelope),
            _ => None,
        }
    }
}
