// Five-lane bucket aggregator (5sec, 2min, 15min, hourly, daily).
// Metric lanes are owned by the sampling worker; ping lanes sit behind a narrow mutex
// because probe results complete concurrently.

mod lane;
mod queue;

pub use queue::ClosedQueue;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::{Bucket, Granularity, PingBucket, ProbeResult, Sample};
use crate::stats::{PipelineStats, bump};
use lane::Lane;

/// What one `ingest` call did across the five lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Lanes whose open bucket was closed by this sample.
    pub closed: usize,
    /// Lanes that dropped the sample as behind their open bucket.
    pub dropped: usize,
}

pub struct Aggregator {
    lanes: [Lane<Bucket>; 5],
    queue: Arc<ClosedQueue>,
    stats: Arc<PipelineStats>,
}

impl Aggregator {
    pub fn new(queue: Arc<ClosedQueue>, stats: Arc<PipelineStats>) -> Self {
        Self {
            lanes: std::array::from_fn(|_| Lane::new()),
            queue,
            stats,
        }
    }

    pub fn queue(&self) -> Arc<ClosedQueue> {
        self.queue.clone()
    }

    /// Accumulates `sample` into the open bucket of every lane, closing buckets whose
    /// interval the sample has moved past.
    pub fn ingest(&mut self, sample: &Sample) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        for g in Granularity::ALL {
            let index = g.index_for(sample.timestamp);
            match self.lanes[g.lane()].slot(index, || Bucket::new(index)) {
                Some((closed, open)) => {
                    open.add(sample);
                    if let Some(closed) = closed {
                        self.queue.push_metric(g, closed);
                        outcome.closed += 1;
                    }
                }
                None => outcome.dropped += 1,
            }
        }
        bump(&self.stats.samples_ingested, 1);
        bump(&self.stats.samples_dropped_skew, outcome.dropped as u64);
        bump(&self.stats.buckets_closed, outcome.closed as u64);
        if outcome.dropped > 0 {
            tracing::debug!(
                operation = "ingest",
                timestamp = sample.timestamp,
                lanes_dropped = outcome.dropped,
                "sample behind open bucket"
            );
        }
        outcome
    }

    /// Closes open buckets whose interval ended at or before `now` (unix seconds).
    pub fn seal_elapsed(&mut self, now: i64) -> usize {
        let mut sealed = 0;
        for g in Granularity::ALL {
            if let Some(closed) = self.lanes[g.lane()].seal_before(g.index_for(now)) {
                self.queue.push_metric(g, closed);
                sealed += 1;
            }
        }
        bump(&self.stats.buckets_closed, sealed as u64);
        sealed
    }

    /// The bucket still accumulating in `granularity`. Not eligible for batches.
    pub fn open_bucket(&self, granularity: Granularity) -> Option<&Bucket> {
        self.lanes[granularity.lane()].open()
    }

    /// Closed-but-unsent buckets of one lane, oldest first.
    pub fn flush(&self, granularity: Granularity) -> Vec<Bucket> {
        self.queue.drain_metrics(granularity)
    }
}

type PingLanes = [BTreeMap<String, Lane<PingBucket>>; 5];

/// Ping lanes keyed by target name.
pub struct PingAggregator {
    lanes: Mutex<PingLanes>,
    queue: Arc<ClosedQueue>,
    stats: Arc<PipelineStats>,
}

impl PingAggregator {
    pub fn new(queue: Arc<ClosedQueue>, stats: Arc<PipelineStats>) -> Self {
        Self {
            lanes: Mutex::new(std::array::from_fn(|_| BTreeMap::new())),
            queue,
            stats,
        }
    }

    /// Records one probe outcome observed at `timestamp` (unix seconds).
    pub fn record(&self, timestamp: i64, result: &ProbeResult) {
        let mut closed_buckets = Vec::new();
        let mut dropped = 0u64;
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            for g in Granularity::ALL {
                let index = g.index_for(timestamp);
                let lane = lanes[g.lane()]
                    .entry(result.name.clone())
                    .or_insert_with(Lane::new);
                match lane.slot(index, || PingBucket::new(index, &result.name, &result.host)) {
                    Some((closed, open)) => {
                        open.add(result);
                        if let Some(closed) = closed {
                            closed_buckets.push((g, closed));
                        }
                    }
                    None => dropped += 1,
                }
            }
        }
        bump(&self.stats.probes_recorded, 1);
        bump(&self.stats.samples_dropped_skew, dropped);
        bump(&self.stats.buckets_closed, closed_buckets.len() as u64);
        for (g, bucket) in closed_buckets {
            self.queue.push_ping(g, bucket);
        }
    }

    /// Closes every target's open bucket whose interval ended at or before `now`, including
    /// targets that are no longer probed. Targets left without an open bucket are forgotten.
    pub fn seal_elapsed(&self, now: i64) -> usize {
        let mut closed_buckets = Vec::new();
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            for g in Granularity::ALL {
                let index = g.index_for(now);
                let targets = &mut lanes[g.lane()];
                for lane in targets.values_mut() {
                    if let Some(closed) = lane.seal_before(index) {
                        closed_buckets.push((g, closed));
                    }
                }
                targets.retain(|_, lane| lane.open().is_some());
            }
        }
        let sealed = closed_buckets.len();
        bump(&self.stats.buckets_closed, sealed as u64);
        for (g, bucket) in closed_buckets {
            self.queue.push_ping(g, bucket);
        }
        sealed
    }

    /// Distinct target names with an open bucket in any lane.
    pub fn tracked_targets(&self) -> usize {
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        lanes
            .iter()
            .flat_map(|targets| targets.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }

    pub fn open_bucket(&self, granularity: Granularity, target_name: &str) -> Option<PingBucket> {
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        lanes[granularity.lane()]
            .get(target_name)
            .and_then(|lane| lane.open().cloned())
    }

    /// Closed ping buckets of one lane, oldest first per target.
    pub fn flush(&self, granularity: Granularity) -> Vec<PingBucket> {
        self.queue.drain_ping(granularity)
    }
}
