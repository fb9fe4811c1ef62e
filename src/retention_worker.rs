// Background worker: drop buckets past their lane's retention, then VACUUM on schedule.
// VACUUM runs on a configurable schedule (cron expression or fixed interval).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::bucket_repo::BucketRepo;
use crate::clock::Clock;
use crate::config::RetentionConfig;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

/// Spawns the retention worker. Returns a join handle.
pub fn spawn(
    repo: Arc<BucketRepo>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let span = tracing::info_span!("retention", interval_secs = config.prune_interval_secs);
    tokio::spawn(run(repo, clock, config, shutdown).instrument(span))
}

async fn run(
    repo: Arc<BucketRepo>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    shutdown: CancellationToken,
) {
    let mut prune_interval = tokio::time::interval(Duration::from_secs(config.prune_interval_secs));
    prune_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (vacuum_tx, mut vacuum_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(vacuum_scheduler(config.clone(), vacuum_tx, shutdown.child_token()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Retention worker shutting down");
                break;
            }
            _ = prune_interval.tick() => {
                if let Err(e) = run_one_tick(&repo, clock.as_ref()).await {
                    warn!(error = %e, operation = "prune_expired", "retention tick failed");
                }
            }
            Some(()) = vacuum_rx.recv() => {
                if let Err(e) = repo.vacuum().await {
                    warn!(error = %e, operation = "vacuum", "vacuum failed");
                } else {
                    info!("vacuum complete");
                }
            }
        }
    }
}

/// Sends a message on `tx` at each VACUUM time (cron or fixed interval). Uses local time for cron.
async fn vacuum_scheduler(
    config: RetentionConfig,
    tx: tokio::sync::mpsc::Sender<()>,
    shutdown: CancellationToken,
) {
    loop {
        let delay = match next_vacuum_delay(&config, chrono::Local::now()) {
            Ok(delay) => delay,
            Err(e) => {
                warn!(error = %e, "invalid vacuum_schedule; VACUUM will not run");
                return;
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Time until the next VACUUM. A cron schedule with no upcoming fire time retries in an hour.
pub fn next_vacuum_delay(
    config: &RetentionConfig,
    now: chrono::DateTime<chrono::Local>,
) -> anyhow::Result<Duration> {
    let Some(ref cron_str) = config.vacuum_schedule else {
        return Ok(Duration::from_secs(config.vacuum_interval_secs));
    };
    let schedule = cron::Schedule::from_str(cron_str)
        .map_err(|e| anyhow::anyhow!("vacuum_schedule {:?}: {}", cron_str, e))?;
    Ok(match schedule.after(&now).next() {
        Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(3600),
    })
}

/// Runs one pruning pass across all lanes.
pub async fn run_one_tick(repo: &BucketRepo, clock: &dyn Clock) -> anyhow::Result<u64> {
    let deleted = repo.prune_expired(clock.unix_now()).await?;
    if deleted > 0 {
        info!(operation = "prune_expired", deleted, "expired buckets pruned");
    } else {
        tracing::debug!(operation = "prune_expired", "nothing to prune");
    }
    Ok(deleted)
}
