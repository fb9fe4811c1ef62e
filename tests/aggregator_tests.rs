// Aggregator tests: lane rollups, skew drops, sealing, bounded queue, ping lanes

mod common;

use common::{sample, target};
use std::sync::Arc;
use vstats::aggregator::{Aggregator, ClosedQueue, PingAggregator};
use vstats::models::{Granularity, ProbeResult, ProbeStatus};
use vstats::stats::PipelineStats;

fn aggregator(capacity: usize) -> (Aggregator, Arc<ClosedQueue>, Arc<PipelineStats>) {
    let stats = Arc::new(PipelineStats::default());
    let queue = Arc::new(ClosedQueue::new(capacity, stats.clone()));
    (Aggregator::new(queue.clone(), stats.clone()), queue, stats)
}

#[test]
fn three_samples_in_one_five_second_bucket() {
    let (mut agg, _, _) = aggregator(16);
    for t in [0, 2, 4] {
        agg.ingest(&sample(t, 10.0));
    }
    let open = agg.open_bucket(Granularity::FiveSec).unwrap();
    assert_eq!(open.index, 0);
    assert_eq!(open.sample_count, 3);
    assert_eq!(open.cpu_sum, 30.0);
    assert_eq!(open.cpu_max, 10.0);
    assert_eq!(open.cpu_avg(), Some(10.0));
    assert!(agg.flush(Granularity::FiveSec).is_empty());
}

#[test]
fn bucket_averages_cover_memory_disk_and_load() {
    let (mut agg, _, _) = aggregator(16);
    for (t, memory, disk, load) in [(0, 40.0, 20.0, 1.0), (2, 60.0, 30.0, 3.0)] {
        let mut s = sample(t, 10.0);
        s.memory.usage_percent = memory;
        s.disks[0].usage_percent = disk;
        s.load_average.one = load;
        agg.ingest(&s);
    }
    let open = agg.open_bucket(Granularity::FiveSec).unwrap();
    assert_eq!(open.memory_avg(), Some(50.0));
    assert_eq!(open.memory_max, 60.0);
    assert_eq!(open.disk_avg(), Some(25.0));
    assert_eq!(open.load_avg(), Some(2.0));
    assert_eq!(open.load_max, 3.0);

    let empty = vstats::models::Bucket::new(7);
    assert_eq!(empty.memory_avg(), None);
    assert_eq!(empty.disk_avg(), None);
    assert_eq!(empty.load_avg(), None);
}

#[test]
fn next_interval_closes_previous_bucket_unchanged() {
    let (mut agg, _, _) = aggregator(16);
    for t in [0, 2, 4] {
        agg.ingest(&sample(t, 10.0));
    }
    let outcome = agg.ingest(&sample(6, 90.0));
    assert_eq!(outcome.closed, 1, "only the 5sec lane crosses a boundary at t=6");

    let closed = agg.flush(Granularity::FiveSec);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].index, 0);
    assert_eq!(closed[0].sample_count, 3);
    assert_eq!(closed[0].cpu_sum, 30.0);
    assert_eq!(closed[0].cpu_max, 10.0);

    let open = agg.open_bucket(Granularity::FiveSec).unwrap();
    assert_eq!(open.index, 1);
    assert_eq!(open.cpu_sum, 90.0);
}

#[test]
fn lanes_are_independent_and_not_cascaded() {
    let (mut agg, _, _) = aggregator(64);
    for t in (0..130).step_by(2) {
        agg.ingest(&sample(t, 20.0));
    }
    let two_min = agg.flush(Granularity::TwoMin);
    assert_eq!(two_min.len(), 1);
    assert_eq!(two_min[0].sample_count, 60);
    let open = agg.open_bucket(Granularity::Hourly).unwrap();
    assert_eq!(open.sample_count, 65);
    assert_eq!(agg.flush(Granularity::FiveSec).len(), 25);
}

#[test]
fn sample_count_matches_samples_in_interval() {
    let (mut agg, _, _) = aggregator(64);
    let timestamps = [0, 1, 3, 5, 9, 10, 14, 15];
    for &t in &timestamps {
        agg.ingest(&sample(t, 1.0));
    }
    agg.seal_elapsed(100);
    for b in agg.flush(Granularity::FiveSec) {
        let expected = timestamps
            .iter()
            .filter(|&&t| Granularity::FiveSec.index_for(t) == b.index)
            .count() as u32;
        assert_eq!(b.sample_count, expected, "bucket {}", b.index);
    }
}

#[test]
fn empty_interval_produces_no_bucket() {
    let (mut agg, _, _) = aggregator(16);
    agg.ingest(&sample(0, 10.0));
    agg.ingest(&sample(20, 10.0));
    let closed = agg.flush(Granularity::FiveSec);
    assert_eq!(closed.iter().map(|b| b.index).collect::<Vec<_>>(), vec![0]);
}

#[test]
fn late_sample_is_dropped_and_counted() {
    let (mut agg, _, stats) = aggregator(16);
    agg.ingest(&sample(10, 10.0));
    let outcome = agg.ingest(&sample(3, 99.0));
    assert_eq!(outcome.dropped, 1, "only the 5sec lane is behind");
    assert_eq!(stats.snapshot().samples_dropped_skew, 1);
    let open = agg.open_bucket(Granularity::FiveSec).unwrap();
    assert_eq!(open.index, 2);
    assert_eq!(open.cpu_max, 10.0);
}

#[test]
fn sample_inside_closed_interval_is_dropped() {
    let (mut agg, _, stats) = aggregator(16);
    agg.ingest(&sample(0, 10.0));
    agg.seal_elapsed(7);
    let outcome = agg.ingest(&sample(4, 50.0));
    assert_eq!(outcome.dropped, 1);
    assert_eq!(stats.snapshot().samples_dropped_skew, 1);
    let closed = agg.flush(Granularity::FiveSec);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].sample_count, 1);
}

#[test]
fn seal_elapsed_closes_stalled_lane() {
    let (mut agg, _, _) = aggregator(16);
    agg.ingest(&sample(0, 10.0));
    assert_eq!(agg.seal_elapsed(4), 0, "interval not over yet");
    assert_eq!(agg.seal_elapsed(5), 1);
    assert!(agg.open_bucket(Granularity::FiveSec).is_none());
    assert!(agg.open_bucket(Granularity::TwoMin).is_some());
}

#[test]
fn identical_input_gives_identical_buckets() {
    let run = || {
        let (mut agg, _, _) = aggregator(64);
        for t in 0..40 {
            agg.ingest(&sample(t, (t % 7) as f64 * 3.5));
        }
        agg.seal_elapsed(10_000);
        serde_json::to_string(&agg.flush(Granularity::FiveSec)).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn full_queue_evicts_oldest() {
    let (mut agg, _, stats) = aggregator(3);
    for t in (0..30).step_by(5) {
        agg.ingest(&sample(t, 10.0));
    }
    let closed = agg.flush(Granularity::FiveSec);
    assert_eq!(closed.iter().map(|b| b.index).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_eq!(stats.snapshot().buckets_evicted, 2);
}

fn probe(name: &str, status: ProbeStatus, latency: Option<f64>) -> ProbeResult {
    ProbeResult {
        name: name.into(),
        host: "192.0.2.1".into(),
        latency_ms: latency,
        packet_loss: if status == ProbeStatus::Ok { 0.0 } else { 100.0 },
        status,
    }
}

#[test]
fn ping_availability_under_partial_failure() {
    let stats = Arc::new(PipelineStats::default());
    let queue = Arc::new(ClosedQueue::new(16, stats.clone()));
    let lanes = PingAggregator::new(queue, stats.clone());
    for t in [0, 10, 20] {
        lanes.record(t, &probe("gw", ProbeStatus::Timeout, None));
    }
    lanes.record(30, &probe("gw", ProbeStatus::Ok, Some(10.0)));
    lanes.record(40, &probe("gw", ProbeStatus::Ok, Some(30.0)));

    let b = lanes.open_bucket(Granularity::TwoMin, "gw").unwrap();
    assert_eq!(b.ok_count, 2);
    assert_eq!(b.fail_count, 3);
    assert_eq!(b.latency_count, 2);
    assert_eq!(b.latency_max, 30.0);
    assert_eq!(b.latency_avg(), Some(20.0));
    assert_eq!(b.availability(), Some(0.4));
    assert_eq!(stats.snapshot().probes_recorded, 5);
}

#[test]
fn ping_total_failure_still_produces_bucket() {
    let stats = Arc::new(PipelineStats::default());
    let queue = Arc::new(ClosedQueue::new(16, stats.clone()));
    let lanes = PingAggregator::new(queue, stats);
    let t = target("dns", "192.0.2.53");
    lanes.record(0, &ProbeResult::failed(&t, ProbeStatus::Error));
    lanes.seal_elapsed(200);
    let closed = lanes.flush(Granularity::TwoMin);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].fail_count, 1);
    assert_eq!(closed[0].availability(), Some(0.0));
    assert_eq!(closed[0].latency_avg(), None);
}

#[test]
fn ping_targets_have_separate_buckets() {
    let stats = Arc::new(PipelineStats::default());
    let queue = Arc::new(ClosedQueue::new(16, stats.clone()));
    let lanes = PingAggregator::new(queue, stats);
    lanes.record(0, &probe("a", ProbeStatus::Ok, Some(1.0)));
    lanes.record(0, &probe("b", ProbeStatus::Ok, Some(2.0)));
    lanes.record(6, &probe("a", ProbeStatus::Ok, Some(1.0)));
    let closed = lanes.flush(Granularity::FiveSec);
    assert_eq!(closed.len(), 1, "only target a moved to the next interval");
    assert_eq!(closed[0].target_name, "a");
    assert_eq!(lanes.seal_elapsed(6), 1, "target b's stale bucket closes on seal");
}

#[test]
fn dropped_target_is_forgotten_once_its_buckets_seal() {
    let stats = Arc::new(PipelineStats::default());
    let queue = Arc::new(ClosedQueue::new(16, stats.clone()));
    let lanes = PingAggregator::new(queue, stats);
    lanes.record(0, &probe("old", ProbeStatus::Ok, Some(1.0)));
    lanes.record(0, &probe("kept", ProbeStatus::Ok, Some(1.0)));
    assert_eq!(lanes.tracked_targets(), 2);

    // Only "kept" is still probed; "old" closes its 5sec bucket but its coarser lanes stay open.
    lanes.seal_elapsed(5);
    lanes.record(5, &probe("kept", ProbeStatus::Ok, Some(1.0)));
    assert_eq!(lanes.tracked_targets(), 2);
    assert!(lanes.open_bucket(Granularity::FiveSec, "old").is_none());

    // Past the end of the first day every lane of "old" has sealed.
    lanes.seal_elapsed(86_400);
    lanes.record(86_400, &probe("kept", ProbeStatus::Ok, Some(1.0)));
    assert_eq!(lanes.tracked_targets(), 1);
    assert!(lanes.open_bucket(Granularity::Daily, "old").is_none());
    assert!(lanes.open_bucket(Granularity::Daily, "kept").is_some());

    // A target seen again starts fresh buckets.
    lanes.record(86_400, &probe("old", ProbeStatus::Ok, Some(1.0)));
    assert_eq!(lanes.open_bucket(Granularity::FiveSec, "old").map(|b| b.index), Some(17_280));
}
