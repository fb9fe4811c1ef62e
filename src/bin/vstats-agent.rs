use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vstats::*;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let agent_config = config::AgentConfig::load()?;
    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
    let stats = Arc::new(stats::PipelineStats::default());
    let queue = Arc::new(aggregator::ClosedQueue::new(
        agent_config.sync.buffer_capacity,
        stats.clone(),
    ));
    let ping_lanes = Arc::new(aggregator::PingAggregator::new(queue.clone(), stats.clone()));
    let targets = Arc::new(prober::TargetSet::new(agent_config.probe.targets.clone()));
    let (live_tx, live_rx) = watch::channel(None);
    let shutdown = CancellationToken::new();

    tracing::info!(
        server_id = %agent_config.agent.server_id,
        server_url = %agent_config.agent.server_url,
        version = version::VERSION,
        "Agent starting"
    );

    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            collector: Arc::new(collector::SysinfoCollector::new()),
            aggregator: aggregator::Aggregator::new(queue.clone(), stats.clone()),
            live_tx,
            stats: stats.clone(),
            clock: clock.clone(),
            shutdown: shutdown.clone(),
        },
        worker::WorkerConfig {
            sample_interval_ms: agent_config.sampling.sample_interval_ms,
            stats_log_interval_secs: agent_config.sampling.stats_log_interval_secs,
        },
    );

    let prober_handle = prober::spawn(
        prober::ProberDeps {
            targets: targets.clone(),
            lanes: ping_lanes,
            clock: clock.clone(),
            shutdown: shutdown.clone(),
        },
        prober::ProberConfig {
            interval: Duration::from_secs(agent_config.probe.interval_secs),
            timeout: Duration::from_millis(agent_config.probe.timeout_ms),
        },
    );

    let sync_handle = sync::SyncClient::new(
        agent_config.sync_config(),
        sync::SyncDeps {
            queue,
            live: live_rx,
            targets,
            stats,
            clock,
        },
    )
    .spawn(shutdown.clone());

    shutdown::signal().await;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();
    let _ = tokio::join!(worker_handle, prober_handle, sync_handle);

    Ok(())
}
