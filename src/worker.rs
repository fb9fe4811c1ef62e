// Agent sampling worker: collect, fold into the five lanes, publish the latest sample.

use crate::aggregator::{Aggregator, IngestOutcome};
use crate::clock::Clock;
use crate::collector::Collector;
use crate::models::Sample;
use crate::stats::PipelineStats;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Collector, lanes, live channel and shutdown for the worker.
pub struct WorkerDeps<C> {
    pub collector: Arc<C>,
    pub aggregator: Aggregator,
    pub live_tx: watch::Sender<Option<Sample>>,
    pub stats: Arc<PipelineStats>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: CancellationToken,
}

/// Worker timing and logging config.
/// Stats logging uses a real-time interval, independent of sample_interval_ms.
pub struct WorkerConfig {
    pub sample_interval_ms: u64,
    /// How often to log pipeline stats (real seconds).
    pub stats_log_interval_secs: u64,
}

/// One sampling tick. The sample is stamped and lanes are sealed from the same clock
/// reading; a failed collection still seals lanes whose interval has elapsed.
pub async fn tick<C: Collector>(
    collector: &C,
    aggregator: &mut Aggregator,
    live_tx: &watch::Sender<Option<Sample>>,
    clock: &dyn Clock,
) -> anyhow::Result<IngestOutcome> {
    let now = clock.unix_now();
    match collector.sample(now).await {
        Ok(sample) => {
            let outcome = aggregator.ingest(&sample);
            aggregator.seal_elapsed(now);
            live_tx.send_replace(Some(sample));
            Ok(outcome)
        }
        Err(e) => {
            aggregator.seal_elapsed(now);
            Err(e)
        }
    }
}

pub fn spawn<C: Collector>(deps: WorkerDeps<C>, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        collector,
        mut aggregator,
        live_tx,
        stats,
        clock,
        shutdown,
    } = deps;
    let WorkerConfig {
        sample_interval_ms,
        stats_log_interval_secs,
    } = config;

    let worker_span = tracing::span!(tracing::Level::DEBUG, "worker", sample_interval_ms);
    tokio::spawn(
        async move {
            let mut sample_tick = interval(Duration::from_millis(sample_interval_ms));
            sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stats_log_tick = interval(Duration::from_secs(stats_log_interval_secs));
            stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Worker shutting down");
                        break;
                    }
                    _ = sample_tick.tick() => {
                        if let Err(e) = tick(collector.as_ref(), &mut aggregator, &live_tx, clock.as_ref()).await {
                            tracing::warn!(
                                error = %e,
                                operation = "sample",
                                "host sample failed"
                            );
                        }
                    }
                    _ = stats_log_tick.tick() => {
                        let s = stats.snapshot();
                        tracing::info!(
                            samples_ingested = s.samples_ingested,
                            samples_dropped_skew = s.samples_dropped_skew,
                            buckets_closed = s.buckets_closed,
                            buckets_evicted = s.buckets_evicted,
                            probes_recorded = s.probes_recorded,
                            live_sent = s.live_sent,
                            batches_sent = s.batches_sent,
                            batches_acked = s.batches_acked,
                            buckets_rejected = s.buckets_rejected,
                            auth_failures = s.auth_failures,
                            disconnects = s.disconnects,
                            "pipeline stats"
                        );
                    }
                }
            }
        }
        .instrument(worker_span),
    )
}
