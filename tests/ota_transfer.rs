/// Distributor and receiver wired back to back, without any transport.
/// Validates the full offer / chunk / end / result exchange plus the
/// stall, integrity and cooldown paths.
use std::time::{Duration, Instant};

use quakemesh::errors::QuakeError;
use quakemesh::ota::{
    Distributor, DistributorConfig, FlashSink, MemoryFlashSink, OtaAction, Receiver, ReceiverConfig, StaticFirmwareSource,
    TerminalReason,
};
use quakemesh::protocol::{Envelope, OtaOffer};
use quakemesh::transport::NodeId;

const ROLE: &str = "ROLE_SENDER_NODE";
const GATEWAY: NodeId = NodeId(100);
const NODE: NodeId = NodeId(1001);

#[derive(Default)]
struct Transcript {
    chunks: Vec<u32>,
    ends: usize,
    results: Vec<(bool, String)>,
    restarted: bool,
    closed: Vec<TerminalReason>,
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn distributor(version: &str, image: Vec<u8>) -> Distributor<StaticFirmwareSource> {
    Distributor::new(
        StaticFirmwareSource::single(version, ROLE, image),
        DistributorConfig {
            chunk_size: 512,
            ..Default::default()
        },
    )
}

fn receiver(version: &str) -> Receiver<MemoryFlashSink> {
    Receiver::new(NODE, "Sender-1", version, MemoryFlashSink::new(), ReceiverConfig::default())
}

/// Shuttle actions between the two engines until both go quiet.
fn pump(
    dist: &mut Distributor<StaticFirmwareSource>,
    rx: &mut Receiver<MemoryFlashSink>,
    initial: Vec<OtaAction>,
    now: Instant,
) -> Transcript {
    let mut t = Transcript::default();
    let mut downstream: Vec<Envelope> = Vec::new();
    let mut upstream: Vec<Envelope> = Vec::new();
    let note = |t: &mut Transcript, action: OtaAction, out: &mut Vec<Envelope>| match action {
        OtaAction::Send { envelope, .. } => out.push(envelope),
        OtaAction::Restart { .. } => t.restarted = true,
        OtaAction::Closed(outcome) => t.closed.push(outcome.reason),
    };
    for a in initial {
        note(&mut t, a, &mut downstream);
    }
    for _ in 0..1000 {
        if downstream.is_empty() && upstream.is_empty() {
            break;
        }
        for env in std::mem::take(&mut downstream) {
            match &env {
                Envelope::OtaChunk(c) => t.chunks.push(c.idx),
                Envelope::OtaEnd(_) => t.ends += 1,
                _ => {}
            }
            for a in rx.handle(GATEWAY, &env, now) {
                note(&mut t, a, &mut upstream);
            }
        }
        for env in std::mem::take(&mut upstream) {
            if let Envelope::OtaResult(r) = &env {
                t.results.push((r.ok, r.msg.clone()));
            }
            for a in dist.handle(NODE, &env, now) {
                note(&mut t, a, &mut downstream);
            }
        }
    }
    t
}

#[tokio::test]
async fn test_full_transfer_in_four_chunks() {
    let firmware = image(2048);
    let mut dist = distributor("2.2.0", firmware.clone());
    let mut rx = receiver("2.1.0");
    let now = Instant::now();

    let offer = dist.on_version_check(NODE, ROLE, "2.1.0", now).await.unwrap();
    assert_eq!(offer.len(), 1);
    match offer[0].envelope() {
        Some(Envelope::OtaOffer(o)) => {
            assert_eq!(o.size, 2048);
            assert_eq!(o.chunk, 512);
            assert_eq!(o.version, "2.2.0");
        }
        other => panic!("expected offer, got {:?}", other),
    }

    let t = pump(&mut dist, &mut rx, offer, now);
    assert_eq!(t.chunks, vec![0, 1, 2, 3]);
    assert_eq!(t.ends, 1);
    assert_eq!(t.results, vec![(true, "update_ok".to_string())]);
    assert!(t.restarted);
    assert!(t.closed.contains(&TerminalReason::Completed));

    assert_eq!(rx.sink().committed(), Some(firmware.as_slice()));
    assert_eq!(rx.current_version(), "2.2.0");
    assert_eq!(rx.sink().stored_version().as_deref(), Some("2.2.0"));
    assert!(!rx.is_busy());
    assert!(!dist.has_session(NODE));
    assert_eq!(dist.stats().completed, 1);
    assert_eq!(dist.stats().chunks_sent, 4);
}

#[tokio::test]
async fn test_short_final_chunk() {
    let firmware = image(1300);
    let mut dist = distributor("2.2.0", firmware.clone());
    let mut rx = receiver("2.1.0");
    let now = Instant::now();

    let offer = dist.trigger(NODE, ROLE, now).await.unwrap();
    let t = pump(&mut dist, &mut rx, offer, now);
    assert_eq!(t.chunks, vec![0, 1, 2]);
    assert_eq!(rx.sink().committed(), Some(firmware.as_slice()));
}

#[test]
fn test_offer_for_running_version_is_noop() {
    let mut rx = receiver("2.2.0");
    let offer = Envelope::OtaOffer(OtaOffer {
        target_node: NODE,
        version: "2.2.0".into(),
        size: 2048,
        chunk: 512,
    });
    let now = Instant::now();
    assert!(rx.handle(GATEWAY, &offer, now).is_empty());
    assert!(rx.handle(GATEWAY, &offer, now).is_empty());
    assert!(!rx.is_busy());
}

#[test]
fn test_offer_for_other_node_is_ignored() {
    let mut rx = receiver("2.1.0");
    let offer = Envelope::OtaOffer(OtaOffer {
        target_node: NodeId(7),
        version: "2.2.0".into(),
        size: 2048,
        chunk: 512,
    });
    assert!(rx.handle(GATEWAY, &offer, Instant::now()).is_empty());
    assert!(!rx.is_busy());
}

#[test]
fn test_receiver_stall_reports_chunk_timeout() {
    let mut rx = receiver("2.1.0");
    let t0 = Instant::now();
    let offer = Envelope::OtaOffer(OtaOffer {
        target_node: NODE,
        version: "2.2.0".into(),
        size: 2048,
        chunk: 512,
    });
    assert_eq!(rx.handle(GATEWAY, &offer, t0).len(), 1);
    assert!(rx.is_busy());

    assert!(rx.check_timeout(t0 + Duration::from_secs(29)).is_empty());

    let actions = rx.check_timeout(t0 + Duration::from_secs(31));
    let result = actions.iter().find_map(|a| match a.envelope() {
        Some(Envelope::OtaResult(r)) => Some(r.clone()),
        _ => None,
    });
    let result = result.expect("timeout result");
    assert!(!result.ok);
    assert_eq!(result.msg, "chunk_timeout");
    assert!(actions
        .iter()
        .any(|a| matches!(a, OtaAction::Closed(o) if o.reason == TerminalReason::TimedOut)));
    assert!(!actions.iter().any(|a| matches!(a, OtaAction::Restart { .. })));
    assert!(!rx.is_busy());
    assert_eq!(rx.consecutive_failures(), 1);
}

#[tokio::test]
async fn test_distributor_session_timeout_frees_session() {
    let mut dist = distributor("2.2.0", image(2048));
    let t0 = Instant::now();
    dist.trigger(NODE, ROLE, t0).await.unwrap();
    assert!(dist.has_session(NODE));

    assert!(dist.check_timeouts(t0 + Duration::from_secs(200)).is_empty());

    let actions = dist.check_timeouts(t0 + Duration::from_secs(301));
    assert!(actions.iter().any(|a| matches!(
        a.envelope(),
        Some(Envelope::OtaAbort(abort)) if abort.reason == "timeout"
    )));
    assert!(!dist.has_session(NODE));
    assert_eq!(dist.stats().timed_out, 1);
}

#[tokio::test]
async fn test_digest_mismatch_sends_no_offer() {
    let mut source = StaticFirmwareSource::single("2.2.0", ROLE, image(2048));
    source.manifest_mut().sha256.insert(ROLE.to_string(), "00".repeat(32));
    let mut dist = Distributor::new(source, DistributorConfig::default());

    let err = dist
        .on_version_check(NODE, ROLE, "2.1.0", Instant::now())
        .await
        .unwrap_err();
    assert!(matches!(err, QuakeError::DigestMismatch { .. }));
    assert!(!dist.has_session(NODE));
    assert_eq!(dist.stats().offers_sent, 0);
    assert_eq!(dist.stats().digest_mismatches, 1);
}

#[tokio::test]
async fn test_uppercase_digest_is_accepted() {
    let firmware = image(600);
    let mut source = StaticFirmwareSource::single("2.2.0", ROLE, firmware.clone());
    let upper = quakemesh::ota::manifest::sha256_hex(&firmware).to_uppercase();
    source.manifest_mut().sha256.insert(ROLE.to_string(), upper);
    let mut dist = Distributor::new(source, DistributorConfig::default());

    let offer = dist.on_version_check(NODE, ROLE, "2.1.0", Instant::now()).await.unwrap();
    assert_eq!(offer.len(), 1);
}

#[tokio::test]
async fn test_auto_update_respects_version_and_cooldown() {
    let mut dist = distributor("2.2.0", image(1024));
    let t0 = Instant::now();

    // already current
    assert!(dist.on_version_check(NODE, ROLE, "2.2.0", t0).await.unwrap().is_empty());

    let first = dist.on_version_check(NODE, ROLE, "2.1.0", t0).await.unwrap();
    assert_eq!(first.len(), 1);
    // session active
    assert!(dist.on_version_check(NODE, ROLE, "2.1.0", t0).await.unwrap().is_empty());

    dist.cancel(NODE);
    // inside the cooldown window
    let later = t0 + Duration::from_secs(60);
    assert!(dist.on_version_check(NODE, ROLE, "2.1.0", later).await.unwrap().is_empty());

    let after = t0 + Duration::from_secs(301);
    assert_eq!(dist.on_version_check(NODE, ROLE, "2.1.0", after).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_auto_disabled_sends_nothing() {
    let mut dist = distributor("2.2.0", image(1024));
    dist.set_auto_enabled(false);
    let actions = dist.on_version_check(NODE, ROLE, "1.0.0", Instant::now()).await.unwrap();
    assert!(actions.is_empty());
}
