// Closed buckets waiting for the server: pending queues, the single in-flight batch,
// and the per-lane acknowledged cursor used to compute the resume point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregator::ClosedQueue;
use crate::models::{Bucket, Granularity, PingBucket};
use crate::protocol::{AggregatedMetrics, BatchAck, GranularityBatch, LastBuckets};
use crate::stats::{PipelineStats, bump};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ack for batch {got} does not match in-flight batch {expected:?}")]
pub struct AckMismatch {
    pub expected: Option<String>,
    pub got: String,
}

struct InFlight {
    batch_id: String,
    metrics: Vec<(Granularity, Vec<Bucket>)>,
    ping: Vec<(Granularity, Vec<PingBucket>)>,
    bucket_count: usize,
    sent_at: Instant,
}

pub struct Outbox {
    metrics: [VecDeque<Bucket>; 5],
    ping: [VecDeque<PingBucket>; 5],
    in_flight: Option<InFlight>,
    acked: LastBuckets,
    capacity: usize,
    stats: Arc<PipelineStats>,
}

fn trim_front<T>(q: &mut VecDeque<T>, capacity: usize, stats: &PipelineStats) {
    while q.len() > capacity {
        q.pop_front();
        bump(&stats.buckets_evicted, 1);
    }
}

impl Outbox {
    /// `capacity` bounds each lane's pending metric and ping queues.
    pub fn new(capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            metrics: std::array::from_fn(|_| VecDeque::new()),
            ping: std::array::from_fn(|_| VecDeque::new()),
            in_flight: None,
            acked: LastBuckets::new(),
            capacity: capacity.max(1),
            stats,
        }
    }

    /// Highest bucket index per lane the server has acknowledged.
    pub fn acked(&self) -> &LastBuckets {
        &self.acked
    }

    pub fn pending_len(&self) -> usize {
        self.metrics.iter().map(VecDeque::len).sum::<usize>()
            + self.ping.iter().map(VecDeque::len).sum::<usize>()
    }

    pub fn pending_metric_indices(&self, granularity: Granularity) -> Vec<i64> {
        self.metrics[granularity.lane()]
            .iter()
            .map(|b| b.index)
            .collect()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight_age(&self, now: Instant) -> Option<Duration> {
        self.in_flight
            .as_ref()
            .map(|f| now.saturating_duration_since(f.sent_at))
    }

    pub fn push_metric(&mut self, granularity: Granularity, bucket: Bucket) {
        if self
            .acked
            .get(&granularity)
            .is_some_and(|&acked| bucket.index <= acked)
        {
            return;
        }
        let q = &mut self.metrics[granularity.lane()];
        q.push_back(bucket);
        trim_front(q, self.capacity, &self.stats);
    }

    pub fn push_ping(&mut self, granularity: Granularity, bucket: PingBucket) {
        let q = &mut self.ping[granularity.lane()];
        q.push_back(bucket);
        trim_front(q, self.capacity, &self.stats);
    }

    /// Moves everything the aggregator has closed into the pending queues.
    pub fn absorb(&mut self, queue: &ClosedQueue) -> usize {
        let mut moved = 0;
        for g in Granularity::ALL {
            for bucket in queue.drain_metrics(g) {
                self.push_metric(g, bucket);
                moved += 1;
            }
            for bucket in queue.drain_ping(g) {
                self.push_ping(g, bucket);
                moved += 1;
            }
        }
        moved
    }

    /// First index to send for `granularity`: one past the newer of the local ack cursor and
    /// what the server reports. `None` when neither side has seen the lane.
    pub fn resume_point(&self, granularity: Granularity, server_last: &LastBuckets) -> Option<i64> {
        let local = self.acked.get(&granularity).copied();
        let remote = server_last.get(&granularity).copied();
        local.max(remote).map(|last| last + 1)
    }

    /// Prepares for a fresh session: the dropped in-flight batch goes back to the front, the
    /// cursor absorbs the server's view, and metric buckets below the resume point are dropped.
    pub fn resume(&mut self, server_last: &LastBuckets) -> LastBuckets {
        self.requeue_in_flight();
        let mut points = LastBuckets::new();
        for g in Granularity::ALL {
            let Some(point) = self.resume_point(g, server_last) else {
                continue;
            };
            self.acked.insert(g, point - 1);
            self.metrics[g.lane()].retain(|b| b.index >= point);
            points.insert(g, point);
        }
        points
    }

    /// Puts the unacknowledged batch back at the front of each lane in its original order.
    pub fn requeue_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        tracing::debug!(
            operation = "requeue_in_flight",
            batch_id = %in_flight.batch_id,
            buckets = in_flight.bucket_count,
            "requeueing unacknowledged batch"
        );
        for (g, buckets) in in_flight.metrics {
            let q = &mut self.metrics[g.lane()];
            for bucket in buckets.into_iter().rev() {
                q.push_front(bucket);
            }
            trim_front(q, self.capacity, &self.stats);
        }
        for (g, buckets) in in_flight.ping {
            let q = &mut self.ping[g.lane()];
            for bucket in buckets.into_iter().rev() {
                q.push_front(bucket);
            }
            trim_front(q, self.capacity, &self.stats);
        }
    }

    /// Builds the next batch of at most `max_buckets`, oldest first per lane, coarse lanes
    /// first so they never wait behind a 5sec backlog. `None` while a batch is in flight or
    /// nothing is pending.
    pub fn next_batch(&mut self, max_buckets: usize, now: Instant) -> Option<AggregatedMetrics> {
        if self.in_flight.is_some() || self.pending_len() == 0 {
            return None;
        }
        let mut budget = max_buckets.max(1);
        let mut metrics = Vec::new();
        let mut ping = Vec::new();
        let mut granularities = Vec::new();

        for g in Granularity::ALL.into_iter().rev() {
            if budget == 0 {
                break;
            }
            let take = budget.min(self.metrics[g.lane()].len());
            let m: Vec<Bucket> = self.metrics[g.lane()].drain(..take).collect();
            budget -= take;
            let take = budget.min(self.ping[g.lane()].len());
            let p: Vec<PingBucket> = self.ping[g.lane()].drain(..take).collect();
            budget -= take;
            if m.is_empty() && p.is_empty() {
                continue;
            }
            granularities.push(GranularityBatch::new(g, m.clone(), p.clone()));
            metrics.push((g, m));
            ping.push((g, p));
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let bucket_count = max_buckets.max(1) - budget;
        self.in_flight = Some(InFlight {
            batch_id: batch_id.clone(),
            metrics,
            ping,
            bucket_count,
            sent_at: now,
        });
        Some(AggregatedMetrics {
            batch_id,
            granularities,
            last_metrics: None,
        })
    }

    /// Clears the in-flight batch and advances the ack cursor. Rejected buckets are not
    /// retried: the server judged them structurally invalid.
    pub fn ack(&mut self, ack: &BatchAck) -> Result<usize, AckMismatch> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.batch_id == ack.batch_id);
        if !matches {
            return Err(AckMismatch {
                expected: self.in_flight.as_ref().map(|f| f.batch_id.clone()),
                got: ack.batch_id.clone(),
            });
        }
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(0);
        };
        for (g, buckets) in &in_flight.metrics {
            if let Some(newest) = buckets.iter().map(|b| b.index).max() {
                self.advance(*g, newest);
            }
        }
        for (g, last) in &ack.last_buckets {
            self.advance(*g, *last);
        }
        if ack.accepted + ack.rejected != in_flight.bucket_count {
            tracing::warn!(
                operation = "batch_ack",
                batch_id = %ack.batch_id,
                sent = in_flight.bucket_count,
                accepted = ack.accepted,
                rejected = ack.rejected,
                "ack counts do not add up to batch size"
            );
        }
        Ok(in_flight.bucket_count)
    }

    fn advance(&mut self, granularity: Granularity, index: i64) {
        let cursor = self.acked.entry(granularity).or_insert(index);
        *cursor = (*cursor).max(index);
        let cursor = *cursor;
        self.metrics[granularity.lane()].retain(|b| b.index > cursor);
    }
}
