//! Pass-through side of a transfer (mesh gateway).
//!
//! OTA lines are recognised on the raw text and forwarded untouched: from
//! the serial link to the addressed mesh node, and from the mesh back up the
//! serial link. They never enter the relay queues, so admission control does
//! not apply to them. A light session per target records what went through
//! for `mesh_status`.
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, trace};

use super::{OtaPhase, OtaRole, SessionOutcome, SessionProgress, SessionTable, TerminalReason, Tracked, SESSION_TIMEOUT};
use crate::logutil::{escape_preview, PAYLOAD_PREVIEW};
use crate::protocol::{is_ota_line, quick_target_node, Envelope, RelaySessionSummary};
use crate::transport::NodeId;

/// Where a recognised OTA line goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRoute {
    /// Unicast to a mesh node.
    ToNode { to: NodeId, raw: String },
    /// No usable target: broadcast on the mesh.
    Broadcast { raw: String },
    /// Up the serial link to the distributor.
    Upstream { raw: String },
}

#[derive(Debug)]
pub struct RelaySession {
    progress: SessionProgress,
    chunk_size: u32,
    chunks_forwarded: u32,
}

impl Tracked for RelaySession {
    fn progress(&self) -> &SessionProgress {
        &self.progress
    }
    fn progress_mut(&mut self) -> &mut SessionProgress {
        &mut self.progress
    }
}

pub struct OtaRelay {
    sessions: SessionTable<RelaySession>,
    timeout: Duration,
    forwarded_down: u64,
    forwarded_up: u64,
}

impl Default for OtaRelay {
    fn default() -> Self {
        Self::new(SESSION_TIMEOUT)
    }
}

impl OtaRelay {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: SessionTable::new(),
            timeout,
            forwarded_down: 0,
            forwarded_up: 0,
        }
    }

    pub fn role(&self) -> OtaRole {
        OtaRole::Relay
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn forwarded(&self) -> (u64, u64) {
        (self.forwarded_down, self.forwarded_up)
    }

    /// Line from the distributor. `None` when it is not OTA traffic.
    pub fn from_serial(&mut self, raw: &str, now: Instant) -> Option<RelayRoute> {
        if !is_ota_line(raw) {
            return None;
        }
        self.forwarded_down += 1;
        trace!(target: "ota", "serial -> mesh {}", escape_preview(raw, PAYLOAD_PREVIEW));
        if let Ok(envelope) = Envelope::parse(raw) {
            self.track_downstream(&envelope, now);
        }
        let route = match quick_target_node(raw) {
            Some(to) if !to.is_unspecified() => RelayRoute::ToNode {
                to,
                raw: raw.to_string(),
            },
            _ => RelayRoute::Broadcast {
                raw: raw.to_string(),
            },
        };
        Some(route)
    }

    /// Payload from a mesh node. `None` when it is not OTA traffic.
    pub fn from_mesh(&mut self, from: NodeId, raw: &str, now: Instant) -> Option<RelayRoute> {
        if !is_ota_line(raw) {
            return None;
        }
        self.forwarded_up += 1;
        trace!(target: "ota", "mesh {} -> serial {}", from, escape_preview(raw, PAYLOAD_PREVIEW));
        if let Ok(envelope) = Envelope::parse(raw) {
            self.track_upstream(from, &envelope, now);
        }
        Some(RelayRoute::Upstream {
            raw: raw.to_string(),
        })
    }

    fn track_downstream(&mut self, envelope: &Envelope, now: Instant) {
        match envelope {
            Envelope::OtaOffer(offer) => {
                let progress = SessionProgress::new(offer.target_node, offer.version.clone(), offer.size, now);
                let replaced = self.sessions.replace(
                    offer.target_node,
                    RelaySession {
                        progress,
                        chunk_size: offer.chunk.max(1),
                        chunks_forwarded: 0,
                    },
                );
                if replaced.is_some() {
                    debug!(target: "ota", "relay session for {} restarted by new offer", offer.target_node);
                }
                info!(
                    target: "ota",
                    "relaying offer {} to node {} ({} bytes)",
                    offer.version, offer.target_node, offer.size
                );
            }
            Envelope::OtaChunk(chunk) => {
                if let Some(s) = self.sessions.get_mut(chunk.target_node) {
                    let len = STANDARD
                        .decode(chunk.data.as_bytes())
                        .map(|d| d.len() as u64)
                        .unwrap_or(0);
                    s.chunks_forwarded += 1;
                    s.progress.phase = OtaPhase::Transferring;
                    s.progress.current_chunk_index = chunk.idx;
                    s.progress
                        .advance_to(chunk.idx as u64 * s.chunk_size as u64 + len);
                    s.progress.touch(now);
                }
            }
            Envelope::OtaEnd(end) => {
                if let Some(s) = self.sessions.get_mut(end.target_node) {
                    s.progress.phase = OtaPhase::Completing;
                    s.progress.touch(now);
                }
            }
            Envelope::OtaAbort(abort) => {
                if let Some(node) = abort.target_node {
                    self.sessions.close(node, TerminalReason::Aborted);
                }
            }
            _ => {}
        }
    }

    fn track_upstream(&mut self, from: NodeId, envelope: &Envelope, now: Instant) {
        match envelope {
            Envelope::OtaAccept(a) => {
                if let Some(s) = self.sessions.get_mut(a.source_node.unwrap_or(from)) {
                    s.progress.phase = OtaPhase::Transferring;
                    s.progress.touch(now);
                }
            }
            Envelope::OtaNext(n) => {
                if let Some(s) = self.sessions.get_mut(n.source_node.unwrap_or(from)) {
                    s.progress.touch(now);
                }
            }
            Envelope::OtaResult(r) => {
                let reason = if r.ok {
                    TerminalReason::Completed
                } else {
                    TerminalReason::Aborted
                };
                let node = r.source_node.unwrap_or(from);
                if self.sessions.close(node, reason).is_some() {
                    info!(target: "ota", "relay session for {} closed: {}", node, r.msg);
                }
            }
            Envelope::OtaAbort(a) => {
                self.sessions
                    .close(a.source_node.unwrap_or(from), TerminalReason::Aborted);
            }
            _ => {}
        }
    }

    /// Forget sessions idle past the distributor timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<SessionOutcome> {
        self.sessions
            .stalled(now, self.timeout)
            .into_iter()
            .filter_map(|node| self.sessions.close(node, TerminalReason::TimedOut))
            .map(|s| SessionOutcome::from_progress(&s.progress, false, "timeout"))
            .collect()
    }

    pub fn summaries(&self, now: Instant) -> Vec<RelaySessionSummary> {
        self.sessions
            .iter()
            .map(|(id, s)| RelaySessionSummary {
                target_node: *id,
                version: s.progress.version.clone(),
                total_size: s.progress.total_size,
                chunks_forwarded: s.chunks_forwarded,
                bytes_forwarded: s.progress.bytes_transferred(),
                idle_ms: s.progress.idle_for(now).as_millis() as u64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OtaChunk, OtaOffer, OtaResult};

    fn line(env: Envelope) -> String {
        env.to_line().unwrap()
    }

    #[test]
    fn non_ota_lines_are_not_claimed() {
        let mut r = OtaRelay::default();
        assert!(r
            .from_serial(r#"{"type":"command","command":"restart_node"}"#, Instant::now())
            .is_none());
        assert!(r
            .from_mesh(NodeId(1), r#"{"type":"sensor_data"}"#, Instant::now())
            .is_none());
    }

    #[test]
    fn offer_chunk_result_lifecycle() {
        let now = Instant::now();
        let mut r = OtaRelay::default();
        let offer = line(Envelope::OtaOffer(OtaOffer {
            target_node: NodeId(5),
            version: "2.2.0".into(),
            size: 6,
            chunk: 4,
        }));
        assert_eq!(
            r.from_serial(&offer, now),
            Some(RelayRoute::ToNode {
                to: NodeId(5),
                raw: offer.clone()
            })
        );
        let chunk = line(Envelope::OtaChunk(OtaChunk {
            target_node: NodeId(5),
            idx: 1,
            data: STANDARD.encode(b"ef"),
        }));
        r.from_serial(&chunk, now);
        let summary = &r.summaries(now)[0];
        assert_eq!(summary.chunks_forwarded, 1);
        assert_eq!(summary.bytes_forwarded, 6);

        let result = line(Envelope::OtaResult(OtaResult {
            source_node: Some(NodeId(5)),
            ok: true,
            msg: "update_ok".into(),
            ..Default::default()
        }));
        assert!(matches!(
            r.from_mesh(NodeId(5), &result, now),
            Some(RelayRoute::Upstream { .. })
        ));
        assert_eq!(r.active_sessions(), 0);
        assert_eq!(r.forwarded(), (2, 1));
    }

    #[test]
    fn untargeted_ota_line_is_broadcast() {
        let mut r = OtaRelay::default();
        let raw = r#"{"type":"ota_abort","reason":"x"}"#;
        assert_eq!(
            r.from_serial(raw, Instant::now()),
            Some(RelayRoute::Broadcast { raw: raw.into() })
        );
    }

    #[test]
    fn idle_relay_sessions_expire() {
        let now = Instant::now();
        let mut r = OtaRelay::new(Duration::from_secs(300));
        let offer = line(Envelope::OtaOffer(OtaOffer {
            target_node: NodeId(9),
            version: "1.0.1".into(),
            size: 10,
            chunk: 512,
        }));
        r.from_serial(&offer, now);
        assert!(r.expire(now + Duration::from_secs(200)).is_empty());
        let gone = r.expire(now + Duration::from_secs(301));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].reason, TerminalReason::TimedOut);
    }
}
