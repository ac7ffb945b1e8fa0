//! Receiving side of a transfer (sender nodes).
//!
//! The receiver owns only progress counters; decoded bytes go straight into a
//! [`FlashSink`]. Replies are addressed to the node the offer came from (the
//! mesh gateway), never broadcast.
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};

use super::{
    FlashSink, OtaAction, OtaPhase, OtaRole, SessionOutcome, SessionProgress, TerminalReason,
    CHUNK_TIMEOUT, MAX_CONSECUTIVE_FAILURES,
};
use crate::metrics;
use crate::protocol::{Envelope, OtaAccept, OtaChunk, OtaNext, OtaOffer, OtaResult};
use crate::transport::NodeId;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub chunk_timeout: Duration,
    pub max_failures: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: CHUNK_TIMEOUT,
            max_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }
}

#[derive(Debug)]
struct ReceiverSession {
    progress: SessionProgress,
    gateway: NodeId,
    begun: bool,
}

pub struct Receiver<S: FlashSink> {
    node_id: NodeId,
    device_name: String,
    current_version: String,
    sink: S,
    session: Option<ReceiverSession>,
    failures: u32,
    config: ReceiverConfig,
    last_outcome: Option<SessionOutcome>,
}

impl<S: FlashSink> Receiver<S> {
    pub fn new(
        node_id: NodeId,
        device_name: impl Into<String>,
        current_version: impl Into<String>,
        sink: S,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            node_id,
            device_name: device_name.into(),
            current_version: current_version.into(),
            sink,
            session: None,
            failures: 0,
            config,
            last_outcome: None,
        }
    }

    pub fn role(&self) -> OtaRole {
        OtaRole::Receiver
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// True from offer acceptance until teardown. Sensor traffic is
    /// suspended meanwhile.
    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    pub fn phase(&self) -> OtaPhase {
        self.session
            .as_ref()
            .map(|s| s.progress.phase)
            .unwrap_or(OtaPhase::Idle)
    }

    pub fn progress(&self) -> Option<&SessionProgress> {
        self.session.as_ref().map(|s| &s.progress)
    }

    pub fn last_outcome(&self) -> Option<&SessionOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Feed one inbound envelope. Non-OTA envelopes yield nothing.
    pub fn handle(&mut self, from: NodeId, envelope: &Envelope, now: Instant) -> Vec<OtaAction> {
        match envelope {
            Envelope::OtaOffer(offer) => self.on_offer(from, offer, now),
            Envelope::OtaChunk(chunk) => self.on_chunk(from, chunk, now),
            Envelope::OtaEnd(end) if self.addressed_to_me(end.target_node) => self.on_end(from),
            Envelope::OtaAbort(abort)
                if abort.target_node.map_or(true, |t| self.addressed_to_me(t)) =>
            {
                self.on_abort(from, &abort.reason)
            }
            _ => Vec::new(),
        }
    }

    fn addressed_to_me(&self, target: NodeId) -> bool {
        target == self.node_id || target.is_unspecified()
    }

    fn reply(&self, envelope: Envelope) -> OtaAction {
        let to = self.session.as_ref().map(|s| s.gateway);
        OtaAction::Send { to, envelope }
    }

    fn request(&self, idx: u32) -> OtaAction {
        self.reply(Envelope::OtaNext(OtaNext {
            source_node: Some(self.node_id),
            idx,
        }))
    }

    fn result(&self, ok: bool, msg: &str, new_version: Option<String>) -> OtaAction {
        self.reply(Envelope::OtaResult(OtaResult {
            source_node: Some(self.node_id),
            ok,
            msg: msg.to_string(),
            new_version,
            device_name: Some(self.device_name.clone()),
            error_count: if ok { None } else { Some(self.failures) },
        }))
    }

    pub fn on_offer(&mut self, from: NodeId, offer: &OtaOffer, now: Instant) -> Vec<OtaAction> {
        if !self.addressed_to_me(offer.target_node) {
            return Vec::new();
        }
        if offer.version.trim().is_empty() || offer.size == 0 {
            debug!(target: "ota", "ignoring malformed offer from {}", from);
            return Vec::new();
        }
        if offer.version == self.current_version {
            debug!(target: "ota", "offer for running version {} ignored", offer.version);
            return Vec::new();
        }
        if let Some(active) = &self.session {
            if active.progress.phase == OtaPhase::Transferring {
                debug!(
                    target: "ota",
                    "offer {} ignored: transfer of {} in progress",
                    offer.version, active.progress.version
                );
                return Vec::new();
            }
            // A pending (not yet started) offer is superseded.
            self.sink.abort();
        }

        info!(
            target: "ota",
            "accepting offer {} ({} bytes, chunk {}) from {}",
            offer.version, offer.size, offer.chunk, from
        );
        let mut progress = SessionProgress::new(self.node_id, offer.version.clone(), offer.size, now);
        progress.consecutive_failures = self.failures;
        self.session = Some(ReceiverSession {
            progress,
            gateway: from,
            begun: false,
        });
        vec![self.reply(Envelope::OtaAccept(OtaAccept {
            source_node: Some(self.node_id),
            device_name: Some(self.device_name.clone()),
        }))]
    }

    pub fn on_chunk(&mut self, from: NodeId, chunk: &OtaChunk, now: Instant) -> Vec<OtaAction> {
        if !self.addressed_to_me(chunk.target_node) {
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if from != session.gateway {
            debug!(target: "ota", "chunk from {} ignored (session gateway {})", from, session.gateway);
            return Vec::new();
        }
        let expected = session.progress.current_chunk_index;
        if chunk.idx < expected {
            debug!(target: "ota", "duplicate chunk {} ignored", chunk.idx);
            return Vec::new();
        }
        if chunk.idx > expected {
            debug!(target: "ota", "chunk {} ahead of {}, re-requesting", chunk.idx, expected);
            return vec![self.request(expected)];
        }

        session.progress.touch(now);
        if !session.begun {
            if let Err(e) = self.sink.begin(session.progress.total_size) {
                warn!(target: "ota", "flash begin failed: {}", e);
                return self.write_failure("begin_fail");
            }
            session.begun = true;
            session.progress.phase = OtaPhase::Transferring;
        }

        let data = match STANDARD.decode(chunk.data.as_bytes()) {
            Ok(d) if !d.is_empty() => d,
            Ok(_) | Err(_) => {
                warn!(target: "ota", "chunk {} failed to decode", chunk.idx);
                return self.chunk_failure(expected);
            }
        };
        let written_so_far = session.progress.bytes_transferred();
        if written_so_far + data.len() as u64 > session.progress.total_size {
            warn!(
                target: "ota",
                "chunk {} overflows image ({} + {} > {})",
                chunk.idx,
                written_so_far,
                data.len(),
                session.progress.total_size
            );
            return self.write_failure("write_fail");
        }
        match self.sink.write(&data) {
            Ok(n) if n == data.len() => {}
            Ok(n) => {
                warn!(target: "ota", "short flash write at chunk {}: {} of {} bytes", chunk.idx, n, data.len());
                return self.write_failure("write_fail");
            }
            Err(e) => {
                warn!(target: "ota", "flash write failed at chunk {}: {}", chunk.idx, e);
                return self.write_failure("write_fail");
            }
        }

        self.failures = 0;
        metrics::inc_ota_chunks_written();
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.progress.consecutive_failures = 0;
        session.progress.advance_to(written_so_far + data.len() as u64);
        session.progress.current_chunk_index = expected + 1;
        vec![self.request(expected + 1)]
    }

    pub fn on_end(&mut self, from: NodeId) -> Vec<OtaAction> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        if from != session.gateway {
            return Vec::new();
        }
        if !session.progress.is_complete() {
            warn!(
                target: "ota",
                "ota_end with {} of {} bytes",
                session.progress.bytes_transferred(),
                session.progress.total_size
            );
            return self.write_failure("incomplete");
        }
        if let Err(e) = self.sink.finish() {
            warn!(target: "ota", "flash finalize failed: {}", e);
            return self.write_failure("finalize_fail");
        }

        let version = session.progress.version.clone();
        if let Err(e) = self.sink.record_version(&version) {
            warn!(target: "ota", "could not record firmware version {}: {}", version, e);
        }
        info!(target: "ota", "update {} written, restarting", version);
        self.failures = 0;
        self.current_version = version.clone();
        let mut actions = vec![self.result(true, "update_ok", Some(version))];
        actions.push(self.teardown(TerminalReason::Completed, true, "update_ok"));
        actions.push(OtaAction::Restart {
            reason: "update_ok".into(),
        });
        actions
    }

    pub fn on_abort(&mut self, from: NodeId, reason: &str) -> Vec<OtaAction> {
        match self.session.as_ref() {
            Some(s) if s.gateway == from || from.is_unspecified() => {}
            _ => return Vec::new(),
        }
        info!(target: "ota", "session aborted by {}: {}", from, reason);
        vec![self.teardown(TerminalReason::Aborted, false, reason)]
    }

    /// Abort a session with no chunk activity inside the chunk timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Vec<OtaAction> {
        let stalled = self
            .session
            .as_ref()
            .is_some_and(|s| s.progress.idle_for(now) > self.config.chunk_timeout);
        if !stalled {
            return Vec::new();
        }
        self.failures += 1;
        metrics::inc_ota_timeouts();
        warn!(target: "ota", "chunk timeout (failures {})", self.failures);
        let mut actions = vec![self.result(false, "chunk_timeout", None)];
        actions.push(self.teardown(TerminalReason::TimedOut, false, "chunk_timeout"));
        self.escalate(&mut actions);
        actions
    }

    /// Decode failure: count it and ask for the same chunk again.
    fn chunk_failure(&mut self, idx: u32) -> Vec<OtaAction> {
        self.failures += 1;
        metrics::inc_ota_chunk_failures();
        if let Some(s) = self.session.as_mut() {
            s.progress.consecutive_failures = self.failures;
        }
        if self.failures >= self.config.max_failures {
            let mut actions = vec![self.result(false, "too_many_failures", None)];
            actions.push(self.teardown(TerminalReason::Aborted, false, "too_many_failures"));
            self.escalate(&mut actions);
            return actions;
        }
        vec![self.request(idx)]
    }

    /// Sink failure: report and abandon the session.
    fn write_failure(&mut self, msg: &str) -> Vec<OtaAction> {
        self.failures += 1;
        metrics::inc_ota_chunk_failures();
        let mut actions = vec![self.result(false, msg, None)];
        actions.push(self.teardown(TerminalReason::Aborted, false, msg));
        self.escalate(&mut actions);
        actions
    }

    fn escalate(&self, actions: &mut Vec<OtaAction>) {
        if self.failures >= self.config.max_failures {
            warn!(target: "ota", "{} consecutive failures, restarting", self.failures);
            actions.push(OtaAction::Restart {
                reason: format!("ota_failures:{}", self.failures),
            });
        }
    }

    fn teardown(&mut self, reason: TerminalReason, ok: bool, message: &str) -> OtaAction {
        if !ok {
            self.sink.abort();
            metrics::inc_ota_failed();
        } else {
            metrics::inc_ota_completed();
        }
        let outcome = match self.session.take() {
            Some(mut s) => {
                s.progress.consecutive_failures = self.failures;
                s.progress.terminate(reason);
                SessionOutcome::from_progress(&s.progress, ok, message)
            }
            None => SessionOutcome {
                node_id: self.node_id,
                reason,
                ok,
                version: String::new(),
                bytes_transferred: 0,
                total_size: 0,
                message: message.to_string(),
            },
        };
        self.last_outcome = Some(outcome.clone());
        OtaAction::Closed(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::MemoryFlashSink;

    const GW: NodeId = NodeId(100);
    const ME: NodeId = NodeId(7);

    fn receiver() -> Receiver<MemoryFlashSink> {
        Receiver::new(ME, "S7", "2.1.0", MemoryFlashSink::new(), ReceiverConfig::default())
    }

    fn offer(version: &str, size: u64) -> OtaOffer {
        OtaOffer {
            target_node: ME,
            version: version.into(),
            size,
            chunk: 4,
        }
    }

    fn chunk(idx: u32, bytes: &[u8]) -> OtaChunk {
        OtaChunk {
            target_node: ME,
            idx,
            data: STANDARD.encode(bytes),
        }
    }

    fn next_idx(actions: &[OtaAction]) -> Option<u32> {
        actions.iter().find_map(|a| match a.envelope() {
            Some(Envelope::OtaNext(n)) => Some(n.idx),
            _ => None,
        })
    }

    #[test]
    fn same_version_offer_is_noop() {
        let mut r = receiver();
        assert!(r.on_offer(GW, &offer("2.1.0", 8), Instant::now()).is_empty());
        assert!(!r.is_busy());
    }

    #[test]
    fn empty_version_or_size_is_ignored() {
        let mut r = receiver();
        assert!(r.on_offer(GW, &offer("", 8), Instant::now()).is_empty());
        assert!(r.on_offer(GW, &offer("2.2.0", 0), Instant::now()).is_empty());
        assert!(!r.is_busy());
    }

    #[test]
    fn offer_for_other_node_is_ignored() {
        let mut r = receiver();
        let mut o = offer("2.2.0", 8);
        o.target_node = NodeId(8);
        assert!(r.on_offer(GW, &o, Instant::now()).is_empty());
    }

    #[test]
    fn chunks_flow_in_order() {
        let now = Instant::now();
        let mut r = receiver();
        let acts = r.on_offer(GW, &offer("2.2.0", 8), now);
        assert!(matches!(acts[0].envelope(), Some(Envelope::OtaAccept(_))));
        assert!(matches!(acts[0], OtaAction::Send { to: Some(GW), .. }));

        assert_eq!(next_idx(&r.on_chunk(GW, &chunk(0, b"abcd"), now)), Some(1));
        // duplicate is dropped silently
        assert!(r.on_chunk(GW, &chunk(0, b"abcd"), now).is_empty());
        // chunk from the future re-requests the expected index
        assert_eq!(next_idx(&r.on_chunk(GW, &chunk(3, b"zz"), now)), Some(1));
        assert_eq!(next_idx(&r.on_chunk(GW, &chunk(1, b"efgh"), now)), Some(2));
        assert_eq!(r.progress().unwrap().bytes_transferred(), 8);

        let acts = r.on_end(GW);
        assert!(acts.iter().any(|a| matches!(
            a.envelope(),
            Some(Envelope::OtaResult(OtaResult { ok: true, .. }))
        )));
        assert!(acts.iter().any(|a| matches!(a, OtaAction::Restart { .. })));
        assert_eq!(r.sink().committed(), Some(&b"abcdefgh"[..]));
        assert_eq!(r.current_version(), "2.2.0");
        assert_eq!(r.last_outcome().unwrap().bytes_transferred, 8);
    }

    #[test]
    fn decode_failure_rerequests_same_chunk() {
        let now = Instant::now();
        let mut r = receiver();
        r.on_offer(GW, &offer("2.2.0", 8), now);
        let bad = OtaChunk {
            target_node: ME,
            idx: 0,
            data: "!!not base64!!".into(),
        };
        assert_eq!(next_idx(&r.on_chunk(GW, &bad, now)), Some(0));
        assert_eq!(r.consecutive_failures(), 1);
        assert!(r.is_busy());
        r.on_chunk(GW, &chunk(0, b"abcd"), now);
        assert_eq!(r.consecutive_failures(), 0);
    }

    #[test]
    fn write_failure_reports_and_tears_down() {
        let now = Instant::now();
        let mut sink = MemoryFlashSink::new();
        sink.fail_write_at = Some(0);
        let mut r = Receiver::new(ME, "S7", "2.1.0", sink, ReceiverConfig::default());
        r.on_offer(GW, &offer("2.2.0", 8), now);
        let acts = r.on_chunk(GW, &chunk(0, b"abcd"), now);
        match acts[0].envelope() {
            Some(Envelope::OtaResult(res)) => {
                assert!(!res.ok);
                assert_eq!(res.msg, "write_fail");
                assert_eq!(res.error_count, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!r.is_busy());
        assert_eq!(r.sink().staged_len(), 0);
    }

    #[test]
    fn short_write_aborts_session() {
        let now = Instant::now();
        let mut sink = MemoryFlashSink::new();
        sink.short_write_at = Some(1);
        let mut r = Receiver::new(ME, "S7", "2.1.0", sink, ReceiverConfig::default());
        r.on_offer(GW, &offer("2.2.0", 8), now);
        r.on_chunk(GW, &chunk(0, b"abcd"), now);
        let acts = r.on_chunk(GW, &chunk(1, b"efgh"), now);
        match acts[0].envelope() {
            Some(Envelope::OtaResult(res)) => {
                assert!(!res.ok);
                assert_eq!(res.msg, "write_fail");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(acts
            .iter()
            .any(|a| matches!(a, OtaAction::Closed(o) if o.reason == TerminalReason::Aborted)));
        assert!(!r.is_busy());
        assert_eq!(r.sink().committed(), None);
    }

    #[test]
    fn stall_times_out_with_chunk_timeout() {
        let now = Instant::now();
        let mut r = receiver();
        r.on_offer(GW, &offer("2.2.0", 8), now);
        assert!(r.check_timeout(now + Duration::from_secs(30)).is_empty());
        let acts = r.check_timeout(now + Duration::from_secs(31));
        match acts[0].envelope() {
            Some(Envelope::OtaResult(res)) => assert_eq!(res.msg, "chunk_timeout"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            acts[1],
            OtaAction::Closed(SessionOutcome {
                reason: TerminalReason::TimedOut,
                ..
            })
        ));
        assert!(!r.is_busy());
        assert_eq!(r.consecutive_failures(), 1);
    }

    #[test]
    fn fifth_failure_restarts() {
        let mut now = Instant::now();
        let mut r = receiver();
        for round in 1..=5 {
            r.on_offer(GW, &offer("2.2.0", 8), now);
            now += Duration::from_secs(31);
            let acts = r.check_timeout(now);
            let restart = acts.iter().any(|a| matches!(a, OtaAction::Restart { .. }));
            assert_eq!(restart, round == 5, "round {round}");
        }
    }

    #[test]
    fn offer_ignored_while_transferring() {
        let now = Instant::now();
        let mut r = receiver();
        r.on_offer(GW, &offer("2.2.0", 8), now);
        r.on_chunk(GW, &chunk(0, b"abcd"), now);
        assert!(r.on_offer(GW, &offer("2.3.0", 8), now).is_empty());
        assert_eq!(r.progress().unwrap().version, "2.2.0");
    }

    #[test]
    fn abort_discards_partial_image() {
        let now = Instant::now();
        let mut r = receiver();
        r.on_offer(GW, &offer("2.2.0", 8), now);
        r.on_chunk(GW, &chunk(0, b"abcd"), now);
        let acts = r.on_abort(GW, "timeout");
        assert_eq!(acts.len(), 1);
        assert!(!r.is_busy());
        assert!(!r.sink().in_progress());
        assert!(r.sink().committed().is_none());
    }
}
