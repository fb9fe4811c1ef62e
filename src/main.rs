use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vstats::*;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let app_config = config::AppConfig::load()?;
    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);

    let repo = Arc::new(
        bucket_repo::BucketRepo::connect(
            &app_config.database.path,
            app_config.database.max_pool_size,
        )
        .await?,
    );
    repo.init().await?;

    let identities = Arc::new(ingest::StaticIdentities::from_config(&app_config));
    if identities.is_empty() {
        tracing::warn!("No agents configured; every agent will be rejected");
    }
    let (live_tx, _) =
        broadcast::channel::<protocol::LiveUpdate>(app_config.publishing.broadcast_capacity);
    let ingest = Arc::new(ingest::IngestService::new(
        repo.clone(),
        identities,
        live_tx,
        clock.clone(),
        app_config.ingest.max_clock_skew_secs,
    ));

    let shutdown = CancellationToken::new();
    let retention_handle = retention_worker::spawn(
        repo.clone(),
        clock.clone(),
        app_config.retention.clone(),
        shutdown.clone(),
    );

    let dashboard_connections = Arc::new(AtomicUsize::new(0));
    let stats_handle = spawn_stats_log(
        ingest.clone(),
        dashboard_connections.clone(),
        app_config.server.stats_log_interval_secs,
        shutdown.clone(),
    );

    let app = routes::app(ingest, dashboard_connections, app_config.clone());
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = shutdown::signal() => {
            tracing::info!("Received shutdown signal");
        }
    }
    shutdown.cancel();
    let _ = retention_handle.await;
    let _ = stats_handle.await;

    Ok(())
}

fn spawn_stats_log(
    ingest: Arc<ingest::IngestService>,
    dashboard_connections: Arc<AtomicUsize>,
    interval_secs: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let s = ingest.stats();
                    tracing::info!(
                        agents_connected = ingest.sessions().connected(),
                        dashboard_clients =
                            dashboard_connections.load(std::sync::atomic::Ordering::Relaxed),
                        batches = s.batches,
                        buckets_accepted = s.buckets_accepted,
                        buckets_rejected = s.buckets_rejected,
                        buckets_stale = s.buckets_stale,
                        auth_failures = s.auth_failures,
                        live_updates = s.live_updates,
                        "app stats"
                    );
                }
            }
        }
    })
}
