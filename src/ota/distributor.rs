//! Distributing side of a transfer (WiFi gateway).
//!
//! A session owns the whole firmware image in memory together with its
//! digest. Images are downloaded and verified before the offer goes out, so a
//! digest mismatch never costs mesh bandwidth.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use serde::Serialize;

use super::manifest::{sha256_hex, verify_digest, FirmwareSource, Manifest, ManifestCache, MANIFEST_TTL};
use super::{
    OtaAction, OtaPhase, OtaRole, SessionOutcome, SessionProgress, SessionTable, TerminalReason,
    Tracked, AUTO_OTA_COOLDOWN, SESSION_TIMEOUT,
};
use crate::errors::{QuakeError, QuakeResult};
use crate::metrics;
use crate::protocol::{
    is_newer, Envelope, OtaAbort, OtaChunk, OtaEnd, OtaOffer, OtaResult, DEFAULT_CHUNK_SIZE,
};
use crate::transport::NodeId;

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub chunk_size: u32,
    pub session_timeout: Duration,
    pub auto_enabled: bool,
    pub auto_cooldown: Duration,
    pub manifest_ttl: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_timeout: SESSION_TIMEOUT,
            auto_enabled: true,
            auto_cooldown: AUTO_OTA_COOLDOWN,
            manifest_ttl: MANIFEST_TTL,
        }
    }
}

#[derive(Debug)]
pub struct DistributorSession {
    progress: SessionProgress,
    image: Vec<u8>,
    digest: String,
    chunk_size: u32,
    highest_sent: Option<u32>,
    failed_chunks: u32,
    chunks_sent: u32,
}

impl Tracked for DistributorSession {
    fn progress(&self) -> &SessionProgress {
        &self.progress
    }
    fn progress_mut(&mut self) -> &mut SessionProgress {
        &mut self.progress
    }
}

impl DistributorSession {
    fn total_chunks(&self) -> u32 {
        let chunk = self.chunk_size.max(1) as u64;
        self.image.len().div_ceil(chunk as usize) as u32
    }
}

/// Session view for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub node_id: NodeId,
    pub version: String,
    pub phase: OtaPhase,
    pub progress: u8,
    pub sent_bytes: u64,
    pub total_bytes: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub is_auto: bool,
    pub elapsed_ms: u64,
    pub failed_chunks: u32,
    pub timed_out: bool,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DistributorStats {
    pub offers_sent: u64,
    pub chunks_sent: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub digest_mismatches: u64,
}

pub struct Distributor<F: FirmwareSource> {
    source: F,
    cache: ManifestCache,
    sessions: SessionTable<DistributorSession>,
    last_auto: HashMap<NodeId, Instant>,
    config: DistributorConfig,
    stats: DistributorStats,
}

impl<F: FirmwareSource> Distributor<F> {
    pub fn new(source: F, config: DistributorConfig) -> Self {
        Self {
            source,
            cache: ManifestCache::new(config.manifest_ttl),
            sessions: SessionTable::new(),
            last_auto: HashMap::new(),
            config,
            stats: DistributorStats::default(),
        }
    }

    pub fn role(&self) -> OtaRole {
        OtaRole::Distributor
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    pub fn stats(&self) -> &DistributorStats {
        &self.stats
    }

    pub fn auto_enabled(&self) -> bool {
        self.config.auto_enabled
    }

    pub fn set_auto_enabled(&mut self, enabled: bool) {
        self.config.auto_enabled = enabled;
    }

    pub fn has_session(&self, node: NodeId) -> bool {
        self.sessions.contains(node)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current manifest, refetched when the cache window has lapsed.
    pub async fn manifest(&mut self, now: Instant) -> QuakeResult<Manifest> {
        if let Some(m) = self.cache.get(now) {
            return Ok(m.clone());
        }
        let fetched = self.source.fetch_manifest().await?;
        self.cache.store(fetched.clone(), now);
        Ok(fetched)
    }

    /// Drop the cached manifest and fetch a fresh one.
    pub async fn refresh_manifest(&mut self, now: Instant) -> QuakeResult<Manifest> {
        self.cache.invalidate();
        self.manifest(now).await
    }

    /// Last known manifest without fetching, with its age.
    pub fn cached_manifest(&self, now: Instant) -> Option<(Manifest, Duration)> {
        let m = self.cache.last()?.clone();
        let age = self.cache.age(now).unwrap_or_default();
        Some((m, age))
    }

    /// Automatic update decision for an `ota_check` announcement.
    pub async fn on_version_check(
        &mut self,
        node: NodeId,
        role_key: &str,
        fw_version: &str,
        now: Instant,
    ) -> QuakeResult<Vec<OtaAction>> {
        if !self.config.auto_enabled || node.is_unspecified() {
            return Ok(Vec::new());
        }
        if self.sessions.contains(node) {
            debug!(target: "ota", "auto OTA skipped for {}: session active", node);
            return Ok(Vec::new());
        }
        if let Some(last) = self.last_auto.get(&node) {
            if now.saturating_duration_since(*last) < self.config.auto_cooldown {
                debug!(target: "ota", "auto OTA skipped for {}: cooldown", node);
                return Ok(Vec::new());
            }
        }
        let manifest = self.manifest(now).await?;
        if !is_newer(fw_version, &manifest.version) {
            debug!(
                target: "ota",
                "node {} on {} is current (latest {})",
                node, fw_version, manifest.version
            );
            return Ok(Vec::new());
        }
        info!(
            target: "ota",
            "auto OTA for node {} ({}): {} -> {}",
            node, role_key, fw_version, manifest.version
        );
        let offer = self.start(node, role_key, true, &manifest, now).await?;
        // only a sent offer starts the cooldown
        self.last_auto.insert(node, now);
        Ok(vec![offer])
    }

    /// Manual trigger from the management surface. Version is not compared.
    pub async fn trigger(&mut self, node: NodeId, role_key: &str, now: Instant) -> QuakeResult<Vec<OtaAction>> {
        if self.sessions.contains(node) {
            return Err(QuakeError::SessionActive(node));
        }
        let manifest = self.manifest(now).await?;
        let offer = self.start(node, role_key, false, &manifest, now).await?;
        Ok(vec![offer])
    }

    /// Download, verify and open a session; returns the offer to send.
    async fn start(
        &mut self,
        node: NodeId,
        role_key: &str,
        is_auto: bool,
        manifest: &Manifest,
        now: Instant,
    ) -> QuakeResult<OtaAction> {
        let url = manifest
            .asset_for(role_key)
            .ok_or_else(|| QuakeError::NoFirmware(role_key.to_string()))?
            .to_string();
        let image = self.source.fetch_firmware(&url).await?;
        if image.is_empty() {
            return Err(QuakeError::Download(format!("empty image at {url}")));
        }
        let digest = match manifest.digest_for(role_key) {
            Some(expected) => match verify_digest(&image, expected) {
                Ok(d) => d,
                Err(e) => {
                    warn!(target: "ota", "OTA for node {} aborted: {}", node, e);
                    self.stats.digest_mismatches += 1;
                    metrics::inc_ota_digest_mismatches();
                    return Err(e);
                }
            },
            None => sha256_hex(&image),
        };

        let mut progress = SessionProgress::new(node, manifest.version.clone(), image.len() as u64, now);
        progress.expected_digest = Some(digest.clone());
        progress.is_auto = is_auto;
        let chunk_size = self.config.chunk_size.max(1);
        let size = image.len() as u64;
        self.sessions.open(
            node,
            DistributorSession {
                progress,
                image,
                digest,
                chunk_size,
                highest_sent: None,
                failed_chunks: 0,
                chunks_sent: 0,
            },
        )?;
        self.stats.offers_sent += 1;
        metrics::inc_ota_offers();
        info!(
            target: "ota",
            "offering {} to node {} ({} bytes, chunk {})",
            manifest.version, node, size, chunk_size
        );
        Ok(OtaAction::Send {
            to: Some(node),
            envelope: Envelope::OtaOffer(OtaOffer {
                target_node: node,
                version: manifest.version.clone(),
                size,
                chunk: chunk_size,
            }),
        })
    }

    /// Feed one envelope that arrived from node `from`.
    pub fn handle(&mut self, from: NodeId, envelope: &Envelope, now: Instant) -> Vec<OtaAction> {
        match envelope {
            Envelope::OtaAccept(a) => self.on_accept(a.source_node.unwrap_or(from), now),
            Envelope::OtaNext(n) => self.on_next(n.source_node.unwrap_or(from), n.idx, now),
            Envelope::OtaResult(r) => self.on_result(r.source_node.unwrap_or(from), r),
            Envelope::OtaAbort(a) => self.on_abort(a.source_node.unwrap_or(from), &a.reason),
            _ => Vec::new(),
        }
    }

    pub fn on_accept(&mut self, node: NodeId, now: Instant) -> Vec<OtaAction> {
        let Some(session) = self.sessions.get_mut(node) else {
            debug!(target: "ota", "ota_accept from {} without session", node);
            return Vec::new();
        };
        session.progress.phase = OtaPhase::Transferring;
        session.progress.touch(now);
        info!(target: "ota", "node {} accepted {}", node, session.progress.version);
        self.send_chunk(node, 0).into_iter().collect()
    }

    pub fn on_next(&mut self, node: NodeId, idx: u32, now: Instant) -> Vec<OtaAction> {
        let Some(session) = self.sessions.get_mut(node) else {
            debug!(target: "ota", "ota_next from {} without session", node);
            return Vec::new();
        };
        session.progress.touch(now);
        session.progress.phase = OtaPhase::Transferring;
        if session.highest_sent.is_some_and(|h| idx <= h) {
            // the receiver asked again for a chunk it already got sent
            session.failed_chunks += 1;
        } else {
            session.failed_chunks = 0;
        }
        let start = idx as u64 * session.chunk_size as u64;
        if start >= session.image.len() as u64 {
            session.progress.phase = OtaPhase::Completing;
            session.progress.current_chunk_index = idx;
            info!(
                target: "ota",
                "all {} chunks sent to node {}, sending ota_end",
                session.total_chunks(),
                node
            );
            return vec![OtaAction::Send {
                to: Some(node),
                envelope: Envelope::OtaEnd(OtaEnd { target_node: node }),
            }];
        }
        self.send_chunk(node, idx).into_iter().collect()
    }

    fn send_chunk(&mut self, node: NodeId, idx: u32) -> Option<OtaAction> {
        let session = self.sessions.get_mut(node)?;
        let chunk = session.chunk_size as usize;
        let start = (idx as usize).saturating_mul(chunk);
        if start >= session.image.len() {
            return None;
        }
        let end = (start + chunk).min(session.image.len());
        let data = STANDARD.encode(&session.image[start..end]);
        session.progress.current_chunk_index = idx;
        session.progress.advance_to(end as u64);
        session.highest_sent = Some(session.highest_sent.map_or(idx, |h| h.max(idx)));
        session.chunks_sent += 1;
        self.stats.chunks_sent += 1;
        metrics::inc_ota_chunks_sent();
        debug!(
            target: "ota",
            "chunk {} -> node {} ({}-{} of {})",
            idx,
            node,
            start,
            end,
            session.image.len()
        );
        Some(OtaAction::Send {
            to: Some(node),
            envelope: Envelope::OtaChunk(OtaChunk {
                target_node: node,
                idx,
                data,
            }),
        })
    }

    pub fn on_result(&mut self, node: NodeId, result: &OtaResult) -> Vec<OtaAction> {
        if !self.sessions.contains(node) {
            debug!(target: "ota", "ota_result from {} without session", node);
            return Vec::new();
        }
        if result.ok {
            info!(
                target: "ota",
                "node {} updated to {}",
                node,
                result.new_version.as_deref().unwrap_or("?")
            );
            vec![self.teardown(node, TerminalReason::Completed, true, &result.msg)]
        } else {
            warn!(
                target: "ota",
                "node {} reported failure: {} (errors {})",
                node,
                result.msg,
                result.error_count.unwrap_or(0)
            );
            vec![self.teardown(node, TerminalReason::Aborted, false, &result.msg)]
        }
    }

    pub fn on_abort(&mut self, node: NodeId, reason: &str) -> Vec<OtaAction> {
        if !self.sessions.contains(node) {
            return Vec::new();
        }
        info!(target: "ota", "node {} aborted transfer: {}", node, reason);
        vec![self.teardown(node, TerminalReason::Aborted, false, reason)]
    }

    /// Abort sessions idle for longer than the session timeout.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<OtaAction> {
        let mut actions = Vec::new();
        for node in self.sessions.stalled(now, self.config.session_timeout) {
            warn!(target: "ota", "OTA session for node {} timed out", node);
            actions.push(OtaAction::Send {
                to: Some(node),
                envelope: Envelope::OtaAbort(OtaAbort {
                    target_node: Some(node),
                    source_node: None,
                    reason: "timeout".into(),
                }),
            });
            actions.push(self.teardown(node, TerminalReason::TimedOut, false, "timeout"));
        }
        actions
    }

    /// Operator cancel: notify the node and tear down.
    pub fn cancel(&mut self, node: NodeId) -> Vec<OtaAction> {
        if !self.sessions.contains(node) {
            return Vec::new();
        }
        vec![
            OtaAction::Send {
                to: Some(node),
                envelope: Envelope::OtaAbort(OtaAbort {
                    target_node: Some(node),
                    source_node: None,
                    reason: "cancelled".into(),
                }),
            },
            self.teardown(node, TerminalReason::Aborted, false, "cancelled"),
        ]
    }

    fn teardown(&mut self, node: NodeId, reason: TerminalReason, ok: bool, message: &str) -> OtaAction {
        match reason {
            TerminalReason::Completed => {
                self.stats.completed += 1;
                metrics::inc_ota_completed();
            }
            TerminalReason::TimedOut => {
                self.stats.timed_out += 1;
                metrics::inc_ota_timeouts();
            }
            _ => {
                self.stats.failed += 1;
                metrics::inc_ota_failed();
            }
        }
        // dropping the session frees the image buffer
        let outcome = match self.sessions.close(node, reason) {
            Some(s) => SessionOutcome::from_progress(&s.progress, ok, message),
            None => SessionOutcome {
                node_id: node,
                reason,
                ok,
                version: String::new(),
                bytes_transferred: 0,
                total_size: 0,
                message: message.to_string(),
            },
        };
        OtaAction::Closed(outcome)
    }

    pub fn sessions(&self, now: Instant) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                node_id: *id,
                version: s.progress.version.clone(),
                phase: s.progress.phase,
                progress: s.progress.progress_percent(),
                sent_bytes: s.progress.bytes_transferred(),
                total_bytes: s.progress.total_size,
                chunk_index: s.progress.current_chunk_index,
                total_chunks: s.total_chunks(),
                is_auto: s.progress.is_auto,
                elapsed_ms: s.progress.elapsed(now).as_millis() as u64,
                failed_chunks: s.failed_chunks,
                timed_out: s.progress.idle_for(now) > self.config.session_timeout,
                sha256: s.digest.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::StaticFirmwareSource;

    const ROLE: &str = "ROLE_SENDER_NODE";
    const NODE: NodeId = NodeId(42);

    fn distributor(image: Vec<u8>) -> Distributor<StaticFirmwareSource> {
        Distributor::new(
            StaticFirmwareSource::single("2.2.0", ROLE, image),
            DistributorConfig::default(),
        )
    }

    fn chunk_indices(actions: &[OtaAction]) -> Vec<u32> {
        actions
            .iter()
            .filter_map(|a| match a.envelope() {
                Some(Envelope::OtaChunk(c)) => Some(c.idx),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn auto_offer_only_when_strictly_newer() {
        let now = Instant::now();
        let mut d = distributor(vec![0u8; 2048]);
        assert!(d
            .on_version_check(NODE, ROLE, "2.2.0", now)
            .await
            .unwrap()
            .is_empty());
        assert!(d
            .on_version_check(NODE, ROLE, "2.10.0", now)
            .await
            .unwrap()
            .is_empty());
        let acts = d.on_version_check(NODE, ROLE, "2.1.9", now).await.unwrap();
        match acts[0].envelope() {
            Some(Envelope::OtaOffer(o)) => {
                assert_eq!(o.size, 2048);
                assert_eq!(o.chunk, 512);
                assert_eq!(o.version, "2.2.0");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(d.has_session(NODE));
    }

    #[tokio::test]
    async fn cooldown_blocks_repeat_auto_offers() {
        let now = Instant::now();
        let mut d = distributor(vec![1u8; 100]);
        assert_eq!(d.on_version_check(NODE, ROLE, "1.0.0", now).await.unwrap().len(), 1);
        d.cancel(NODE);
        let later = now + Duration::from_secs(60);
        assert!(d.on_version_check(NODE, ROLE, "1.0.0", later).await.unwrap().is_empty());
        let much_later = now + Duration::from_secs(301);
        assert_eq!(d.on_version_check(NODE, ROLE, "1.0.0", much_later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_auto_attempt_leaves_no_cooldown() {
        let now = Instant::now();
        let mut d = distributor(vec![1u8; 100]);
        let err = d
            .on_version_check(NODE, "ROLE_MESH_GATEWAY", "1.0.0", now)
            .await
            .unwrap_err();
        assert!(matches!(err, QuakeError::NoFirmware(_)));
        let retry = now + Duration::from_secs(5);
        assert_eq!(d.on_version_check(NODE, ROLE, "1.0.0", retry).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn digest_mismatch_sends_no_offer() {
        let now = Instant::now();
        let mut src = StaticFirmwareSource::single("2.2.0", ROLE, vec![7u8; 64]);
        src.manifest_mut()
            .sha256
            .insert(ROLE.into(), "0".repeat(64));
        let mut d = Distributor::new(src, DistributorConfig::default());
        let err = d.trigger(NODE, ROLE, now).await.unwrap_err();
        assert!(matches!(err, QuakeError::DigestMismatch { .. }));
        assert!(!d.has_session(NODE));
        assert_eq!(d.stats().offers_sent, 0);
        assert_eq!(d.stats().digest_mismatches, 1);
    }

    #[tokio::test]
    async fn missing_asset_is_reported() {
        let now = Instant::now();
        let mut d = distributor(vec![1u8; 10]);
        let err = d.trigger(NODE, "ROLE_MESH_GATEWAY", now).await.unwrap_err();
        assert!(matches!(err, QuakeError::NoFirmware(_)));
    }

    #[tokio::test]
    async fn pull_loop_sends_ceil_chunks_then_end() {
        let now = Instant::now();
        let mut d = distributor(vec![9u8; 1300]);
        d.trigger(NODE, ROLE, now).await.unwrap();
        let mut sent = chunk_indices(&d.on_accept(NODE, now));
        let mut idx = 1;
        loop {
            let acts = d.on_next(NODE, idx, now);
            if acts
                .iter()
                .any(|a| matches!(a.envelope(), Some(Envelope::OtaEnd(_))))
            {
                break;
            }
            sent.extend(chunk_indices(&acts));
            idx += 1;
        }
        assert_eq!(sent, vec![0, 1, 2]);
        let info = &d.sessions(now)[0];
        assert_eq!(info.sent_bytes, 1300);
        assert_eq!(info.progress, 100);
        assert_eq!(info.total_chunks, 3);
    }

    #[tokio::test]
    async fn rerequest_counts_failed_chunk_and_keeps_bytes() {
        let now = Instant::now();
        let mut d = distributor(vec![9u8; 2048]);
        d.trigger(NODE, ROLE, now).await.unwrap();
        d.on_accept(NODE, now);
        d.on_next(NODE, 1, now);
        let before = d.sessions(now)[0].sent_bytes;
        assert_eq!(chunk_indices(&d.on_next(NODE, 1, now)), vec![1]);
        let info = &d.sessions(now)[0];
        assert_eq!(info.failed_chunks, 1);
        assert_eq!(info.sent_bytes, before);
    }

    #[tokio::test]
    async fn stalled_session_aborts_with_timeout() {
        let now = Instant::now();
        let mut d = distributor(vec![9u8; 600]);
        d.trigger(NODE, ROLE, now).await.unwrap();
        assert!(d.check_timeouts(now + Duration::from_secs(300)).is_empty());
        let acts = d.check_timeouts(now + Duration::from_secs(301));
        match acts[0].envelope() {
            Some(Envelope::OtaAbort(a)) => {
                assert_eq!(a.reason, "timeout");
                assert_eq!(a.target_node, Some(NODE));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!d.has_session(NODE));
        assert_eq!(d.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn manual_trigger_refuses_second_session() {
        let now = Instant::now();
        let mut d = distributor(vec![1u8; 10]);
        d.trigger(NODE, ROLE, now).await.unwrap();
        assert!(matches!(
            d.trigger(NODE, ROLE, now).await,
            Err(QuakeError::SessionActive(NODE))
        ));
    }

    #[tokio::test]
    async fn manifest_is_cached() {
        let now = Instant::now();
        let mut d = distributor(vec![1u8; 10]);
        d.manifest(now).await.unwrap();
        d.manifest(now + Duration::from_secs(10)).await.unwrap();
        assert_eq!(d.source().manifest_fetches(), 1);
        d.refresh_manifest(now + Duration::from_secs(11)).await.unwrap();
        assert_eq!(d.source().manifest_fetches(), 2);
        d.manifest(now + Duration::from_secs(400)).await.unwrap();
        assert_eq!(d.source().manifest_fetches(), 3);
    }

    #[tokio::test]
    async fn result_closes_session() {
        let now = Instant::now();
        let mut d = distributor(vec![1u8; 10]);
        d.trigger(NODE, ROLE, now).await.unwrap();
        let acts = d.on_result(
            NODE,
            &OtaResult {
                ok: true,
                msg: "update_ok".into(),
                new_version: Some("2.2.0".into()),
                ..Default::default()
            },
        );
        assert!(matches!(
            &acts[0],
            OtaAction::Closed(SessionOutcome { ok: true, reason: TerminalReason::Completed, .. })
        ));
        assert_eq!(d.session_count(), 0);
    }
}
