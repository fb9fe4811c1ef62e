// Ingestion service: authenticates agents, validates and idempotently stores their
// batches, and fans live samples out to dashboard subscribers.

pub mod identity;
pub mod session;
pub mod validate;

pub use identity::{AgentIdentity, AuthError, IdentityProvider, StaticIdentities};
pub use session::{SessionHandle, SessionRegistry, SessionSummary};
pub use validate::Rejection;

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::bucket_repo::BucketRepo;
use crate::clock::Clock;
use crate::models::Sample;
use crate::protocol::{
    AggregatedMetrics, AuthStatus, BatchAck, LiveUpdate, ServerMessage, last_seen_from,
};

#[derive(Debug, Default)]
struct IngestCounters {
    batches: AtomicU64,
    buckets_accepted: AtomicU64,
    buckets_rejected: AtomicU64,
    buckets_stale: AtomicU64,
    auth_failures: AtomicU64,
    live_updates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub batches: u64,
    pub buckets_accepted: u64,
    pub buckets_rejected: u64,
    /// Accepted buckets that did not replace a stored row with more samples.
    pub buckets_stale: u64,
    pub auth_failures: u64,
    pub live_updates: u64,
}

pub struct IngestService {
    repo: Arc<BucketRepo>,
    identities: Arc<dyn IdentityProvider>,
    sessions: SessionRegistry,
    live_tx: broadcast::Sender<LiveUpdate>,
    clock: Arc<dyn Clock>,
    max_clock_skew_secs: i64,
    counters: IngestCounters,
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl IngestService {
    pub fn new(
        repo: Arc<BucketRepo>,
        identities: Arc<dyn IdentityProvider>,
        live_tx: broadcast::Sender<LiveUpdate>,
        clock: Arc<dyn Clock>,
        max_clock_skew_secs: i64,
    ) -> Self {
        Self {
            repo,
            identities,
            sessions: SessionRegistry::new(),
            live_tx,
            clock,
            max_clock_skew_secs,
            counters: IngestCounters::default(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.live_tx.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            batches: c.batches.load(Ordering::Relaxed),
            buckets_accepted: c.buckets_accepted.load(Ordering::Relaxed),
            buckets_rejected: c.buckets_rejected.load(Ordering::Relaxed),
            buckets_stale: c.buckets_stale.load(Ordering::Relaxed),
            auth_failures: c.auth_failures.load(Ordering::Relaxed),
            live_updates: c.live_updates.load(Ordering::Relaxed),
        }
    }

    pub fn check_credentials(&self, server_id: &str, token: &str) -> Result<AgentIdentity, AuthError> {
        self.identities
            .authenticate(server_id, token)
            .inspect_err(|e| {
                add(&self.counters.auth_failures, 1);
                tracing::warn!(server_id, error = %e, "agent authentication failed");
            })
    }

    /// Registers the session and builds the `auth` reply carrying the resume state.
    pub async fn open_session(
        &self,
        identity: &AgentIdentity,
        version: &str,
    ) -> anyhow::Result<(SessionHandle, ServerMessage)> {
        let last_buckets = self.repo.last_buckets(&identity.server_id).await?;
        let handle = self.sessions.open(
            &identity.server_id,
            version,
            last_buckets.clone(),
            self.clock.unix_now(),
        );
        tracing::info!(
            server_id = %identity.server_id,
            session_id = handle.session_id,
            version,
            last_buckets = ?last_buckets,
            "agent authenticated"
        );
        let reply = ServerMessage::Auth {
            status: AuthStatus::Ok,
            message: None,
            ping_targets: Some(identity.ping_targets.clone()),
            last_seen: last_seen_from(&last_buckets),
            last_buckets,
        };
        Ok((handle, reply))
    }

    pub fn close_session(&self, server_id: &str, session_id: u64) {
        if self.sessions.close(server_id, session_id) {
            tracing::info!(server_id, session_id, "agent disconnected");
        }
    }

    /// Validates every bucket on its own, stores the valid ones in one transaction and
    /// answers with the resulting resume state. Invalid buckets only bump `rejected`.
    pub async fn ingest_batch(
        &self,
        server_id: &str,
        session_id: u64,
        batch: &AggregatedMetrics,
    ) -> anyhow::Result<BatchAck> {
        let now = self.clock.unix_now();
        let latest_start = now + self.max_clock_skew_secs;
        let mut metrics = Vec::new();
        let mut pings = Vec::new();
        let mut rejected = 0usize;

        for lane in &batch.granularities {
            let g = match validate::lane_of(lane) {
                Ok(g) => g,
                Err(e) => {
                    rejected += lane.metrics.len() + lane.ping.len();
                    tracing::debug!(server_id, error = %e, "granularity batch rejected");
                    continue;
                }
            };
            for item in &lane.metrics {
                match validate::validate_bucket(g, item, latest_start) {
                    Ok(b) => metrics.push((g, b)),
                    Err(e) => {
                        rejected += 1;
                        tracing::debug!(server_id, granularity = %g, error = %e, "bucket rejected");
                    }
                }
            }
            for item in &lane.ping {
                match validate::validate_ping(g, item, latest_start) {
                    Ok(p) => pings.push((g, p)),
                    Err(e) => {
                        rejected += 1;
                        tracing::debug!(server_id, granularity = %g, error = %e, "ping bucket rejected");
                    }
                }
            }
        }

        let accepted = metrics.len() + pings.len();
        let outcome = self
            .repo
            .upsert_batch(server_id, &metrics, &pings, now)
            .await?;
        let last_buckets = self.repo.last_buckets(server_id).await?;
        self.sessions
            .record_batch(server_id, session_id, accepted, rejected, &last_buckets);
        if let Some(sample) = &batch.last_metrics {
            self.record_live(server_id, sample.clone());
        }

        add(&self.counters.batches, 1);
        add(&self.counters.buckets_accepted, accepted);
        add(&self.counters.buckets_rejected, rejected);
        add(&self.counters.buckets_stale, outcome.stale as usize);
        if rejected > 0 {
            tracing::warn!(
                server_id,
                batch_id = %batch.batch_id,
                accepted,
                rejected,
                "batch contained invalid buckets"
            );
        }
        tracing::debug!(
            server_id,
            batch_id = %batch.batch_id,
            accepted,
            rejected,
            applied = outcome.applied,
            stale = outcome.stale,
            "batch ingested"
        );

        Ok(BatchAck {
            batch_id: batch.batch_id.clone(),
            accepted,
            rejected,
            last_seen: last_seen_from(&last_buckets),
            last_buckets,
        })
    }

    /// Updates the latest-state cache and notifies dashboards. Never persisted.
    pub fn record_live(&self, server_id: &str, metrics: Sample) {
        let update = LiveUpdate {
            server_id: server_id.to_string(),
            received_at: self.clock.unix_now(),
            metrics,
        };
        self.sessions.update_live(update.clone());
        add(&self.counters.live_updates, 1);
        // No subscribers is the normal state when no dashboard is open.
        let _ = self.live_tx.send(update);
    }
}
