// Bounded per-lane queue of closed buckets awaiting the sync client

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::{Bucket, Granularity, PingBucket};
use crate::stats::{PipelineStats, bump};

/// Closed buckets are only ever appended here by the producers and drained by the sync
/// client; the producers never see them again.
pub struct ClosedQueue {
    metrics: [Mutex<VecDeque<Bucket>>; 5],
    ping: [Mutex<VecDeque<PingBucket>>; 5],
    capacity: usize,
    stats: Arc<PipelineStats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClosedQueue {
    /// `capacity` bounds each lane's metric queue and ping queue separately.
    pub fn new(capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            metrics: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            ping: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push_metric(&self, granularity: Granularity, bucket: Bucket) {
        let mut q = lock(&self.metrics[granularity.lane()]);
        push_bounded(&mut q, bucket, self.capacity, &self.stats);
    }

    pub fn push_ping(&self, granularity: Granularity, bucket: PingBucket) {
        let mut q = lock(&self.ping[granularity.lane()]);
        push_bounded(&mut q, bucket, self.capacity, &self.stats);
    }

    /// Takes every closed metric bucket of the lane, oldest first.
    pub fn drain_metrics(&self, granularity: Granularity) -> Vec<Bucket> {
        lock(&self.metrics[granularity.lane()]).drain(..).collect()
    }

    pub fn drain_ping(&self, granularity: Granularity) -> Vec<PingBucket> {
        lock(&self.ping[granularity.lane()]).drain(..).collect()
    }

    pub fn len(&self, granularity: Granularity) -> usize {
        lock(&self.metrics[granularity.lane()]).len() + lock(&self.ping[granularity.lane()]).len()
    }

    pub fn is_empty(&self) -> bool {
        Granularity::ALL.into_iter().all(|g| self.len(g) == 0)
    }
}

fn push_bounded<T>(q: &mut VecDeque<T>, item: T, capacity: usize, stats: &PipelineStats) {
    if q.len() >= capacity {
        q.pop_front();
        bump(&stats.buckets_evicted, 1);
    }
    q.push_back(item);
}
