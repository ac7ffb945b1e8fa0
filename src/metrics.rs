//! Process-wide relay and OTA counters.
//!
//! Role loops keep their own stats structs for the management surface; these
//! atomics aggregate across every engine in the process (the `simulate`
//! command runs all three roles at once).
use std::sync::atomic::{AtomicU64, Ordering};

static ENVELOPES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static ENVELOPES_MALFORMED: AtomicU64 = AtomicU64::new(0);
static RELAY_ADMITTED_PRIORITY: AtomicU64 = AtomicU64::new(0);
static RELAY_ADMITTED_NORMAL: AtomicU64 = AtomicU64::new(0);
static RELAY_DROPPED: AtomicU64 = AtomicU64::new(0);
static RELAY_FORWARDED: AtomicU64 = AtomicU64::new(0);
static RELAY_BATCHES: AtomicU64 = AtomicU64::new(0);
static OTA_OFFERS: AtomicU64 = AtomicU64::new(0);
static OTA_CHUNKS_SENT: AtomicU64 = AtomicU64::new(0);
static OTA_CHUNKS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static OTA_CHUNK_FAILURES: AtomicU64 = AtomicU64::new(0);
static OTA_COMPLETED: AtomicU64 = AtomicU64::new(0);
static OTA_FAILED: AtomicU64 = AtomicU64::new(0);
static OTA_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static OTA_DIGEST_MISMATCHES: AtomicU64 = AtomicU64::new(0);

pub fn inc_envelopes_received() {
    ENVELOPES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_envelopes_malformed() {
    ENVELOPES_MALFORMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_relay_admitted(priority: bool) {
    if priority {
        RELAY_ADMITTED_PRIORITY.fetch_add(1, Ordering::Relaxed);
    } else {
        RELAY_ADMITTED_NORMAL.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn inc_relay_dropped() {
    RELAY_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_relay_forwarded(n: u64) {
    RELAY_FORWARDED.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_relay_batches() {
    RELAY_BATCHES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_offers() {
    OTA_OFFERS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_chunks_sent() {
    OTA_CHUNKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_chunks_written() {
    OTA_CHUNKS_WRITTEN.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_chunk_failures() {
    OTA_CHUNK_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_completed() {
    OTA_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_failed() {
    OTA_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_timeouts() {
    OTA_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ota_digest_mismatches() {
    OTA_DIGEST_MISMATCHES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub envelopes_received: u64,
    pub envelopes_malformed: u64,
    pub relay_admitted_priority: u64,
    pub relay_admitted_normal: u64,
    pub relay_dropped: u64,
    pub relay_forwarded: u64,
    pub relay_batches: u64,
    pub ota_offers: u64,
    pub ota_chunks_sent: u64,
    pub ota_chunks_written: u64,
    pub ota_chunk_failures: u64,
    pub ota_completed: u64,
    pub ota_failed: u64,
    pub ota_timeouts: u64,
    pub ota_digest_mismatches: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        envelopes_received: ENVELOPES_RECEIVED.load(Ordering::Relaxed),
        envelopes_malformed: ENVELOPES_MALFORMED.load(Ordering::Relaxed),
        relay_admitted_priority: RELAY_ADMITTED_PRIORITY.load(Ordering::Relaxed),
        relay_admitted_normal: RELAY_ADMITTED_NORMAL.load(Ordering::Relaxed),
        relay_dropped: RELAY_DROPPED.load(Ordering::Relaxed),
        relay_forwarded: RELAY_FORWARDED.load(Ordering::Relaxed),
        relay_batches: RELAY_BATCHES.load(Ordering::Relaxed),
        ota_offers: OTA_OFFERS.load(Ordering::Relaxed),
        ota_chunks_sent: OTA_CHUNKS_SENT.load(Ordering::Relaxed),
        ota_chunks_written: OTA_CHUNKS_WRITTEN.load(Ordering::Relaxed),
        ota_chunk_failures: OTA_CHUNK_FAILURES.load(Ordering::Relaxed),
        ota_completed: OTA_COMPLETED.load(Ordering::Relaxed),
        ota_failed: OTA_FAILED.load(Ordering::Relaxed),
        ota_timeouts: OTA_TIMEOUTS.load(Ordering::Relaxed),
        ota_digest_mismatches: OTA_DIGEST_MISMATCHES.load(Ordering::Relaxed),
    }
}
