use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for events spec §7 says are "recovered locally ...
/// and counted in statistics" rather than surfaced as an error: dropped
/// decode failures and pool exhaustion. Kept as a flat set of atomics
/// (no locking) since increments happen on the inbound-segment hot path.
#[derive(Debug, Default)]
pub struct Stats {
    pub segments_decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub segments_dropped_unacceptable: AtomicU64,
    pub retransmits: AtomicU64,
    pub fast_retransmits: AtomicU64,
    pub persist_probes: AtomicU64,
    pub connections_aborted: AtomicU64,
    pub connections_reset_by_peer: AtomicU64,
    pub pool_exhausted: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
