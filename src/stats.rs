// Pipeline counters shared by the sampling worker, prober and sync client

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub samples_ingested: AtomicU64,
    /// Per-lane drops of samples that arrived behind the open bucket.
    pub samples_dropped_skew: AtomicU64,
    pub buckets_closed: AtomicU64,
    /// Closed buckets discarded because a retention buffer was full.
    pub buckets_evicted: AtomicU64,
    pub probes_recorded: AtomicU64,
    pub live_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_acked: AtomicU64,
    pub buckets_accepted: AtomicU64,
    pub buckets_rejected: AtomicU64,
    pub auth_failures: AtomicU64,
    pub disconnects: AtomicU64,
}

/// Plain copy of [`PipelineStats`] for logging and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub samples_ingested: u64,
    pub samples_dropped_skew: u64,
    pub buckets_closed: u64,
    pub buckets_evicted: u64,
    pub probes_recorded: u64,
    pub live_sent: u64,
    pub batches_sent: u64,
    pub batches_acked: u64,
    pub buckets_accepted: u64,
    pub buckets_rejected: u64,
    pub auth_failures: u64,
    pub disconnects: u64,
}

pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            samples_ingested: load(&self.samples_ingested),
            samples_dropped_skew: load(&self.samples_dropped_skew),
            buckets_closed: load(&self.buckets_closed),
            buckets_evicted: load(&self.buckets_evicted),
            probes_recorded: load(&self.probes_recorded),
            live_sent: load(&self.live_sent),
            batches_sent: load(&self.batches_sent),
            batches_acked: load(&self.batches_acked),
            buckets_accepted: load(&self.buckets_accepted),
            buckets_rejected: load(&self.buckets_rejected),
            auth_failures: load(&self.auth_failures),
            disconnects: load(&self.disconnects),
        }
    }
}
