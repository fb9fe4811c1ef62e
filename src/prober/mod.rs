// Ping prober: merges default and server-pushed targets, probes them on a slow cadence
// and records every outcome (failures included) into the ping lanes.

pub mod icmp;

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregator::PingAggregator;
use crate::clock::Clock;
use crate::models::{PingTargetConfig, ProbeKind, ProbeResult, ProbeStatus};

/// Configured defaults plus the custom list the server may replace at any time.
pub struct TargetSet {
    defaults: Vec<PingTargetConfig>,
    custom: RwLock<Vec<PingTargetConfig>>,
}

impl TargetSet {
    pub fn new(defaults: Vec<PingTargetConfig>) -> Self {
        Self {
            defaults,
            custom: RwLock::new(Vec::new()),
        }
    }

    pub fn set_custom(&self, targets: Vec<PingTargetConfig>) {
        let count = targets.len();
        *self.custom.write().unwrap_or_else(PoisonError::into_inner) = targets;
        tracing::info!(
            operation = "set_ping_targets",
            custom_targets = count,
            "ping targets updated"
        );
    }

    pub fn effective(&self) -> Vec<PingTargetConfig> {
        let custom = self.custom.read().unwrap_or_else(PoisonError::into_inner);
        merge_targets(&self.defaults, &custom)
    }
}

/// Defaults first, then custom; the first target for a host (or a name) wins and blank
/// hosts are skipped.
pub fn merge_targets(
    defaults: &[PingTargetConfig],
    custom: &[PingTargetConfig],
) -> Vec<PingTargetConfig> {
    let mut hosts = HashSet::new();
    let mut names = HashSet::new();
    defaults
        .iter()
        .chain(custom)
        .filter(|t| {
            let host = t.host.trim().to_ascii_lowercase();
            if host.is_empty() || names.contains(&t.name) || hosts.contains(&host) {
                return false;
            }
            names.insert(t.name.clone());
            hosts.insert(host);
            true
        })
        .cloned()
        .collect()
}

async fn probe_tcp(target: &PingTargetConfig, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    let addr = (target.host.as_str(), target.tcp_port());
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeResult {
            name: target.name.clone(),
            host: target.host.clone(),
            latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            packet_loss: 0.0,
            status: ProbeStatus::Ok,
        },
        Ok(Err(e)) => {
            tracing::debug!(
                error = %e,
                operation = "tcp_probe",
                host = %target.host,
                port = target.tcp_port(),
                "connect failed"
            );
            ProbeResult::failed(target, ProbeStatus::Error)
        }
        Err(_) => ProbeResult::failed(target, ProbeStatus::Timeout),
    }
}

pub async fn probe(target: &PingTargetConfig, timeout: Duration) -> ProbeResult {
    match target.kind {
        ProbeKind::Icmp => icmp::probe(target, timeout).await,
        ProbeKind::Tcp => probe_tcp(target, timeout).await,
    }
}

pub struct ProberConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

pub struct ProberDeps {
    pub targets: Arc<TargetSet>,
    pub lanes: Arc<PingAggregator>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: CancellationToken,
}

/// Runs one probe round: seal elapsed ping buckets, probe every target concurrently and
/// record each result against the round's start time.
pub async fn run_round(deps: &ProberDeps, timeout: Duration) -> usize {
    let now = deps.clock.unix_now();
    deps.lanes.seal_elapsed(now);

    let mut set = JoinSet::new();
    for target in deps.targets.effective() {
        set.spawn(async move { probe(&target, timeout).await });
    }
    let mut recorded = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => {
                deps.lanes.record(now, &result);
                recorded += 1;
            }
            Err(e) => tracing::warn!(error = %e, operation = "probe", "probe task failed"),
        }
    }
    recorded
}

pub fn spawn(deps: ProberDeps, config: ProberConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = deps.shutdown.cancelled() => {
                    tracing::debug!("Prober shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let recorded = run_round(&deps, config.timeout).await;
                    tracing::debug!(
                        operation = "probe_round",
                        targets = recorded,
                        tracked_targets = deps.lanes.tracked_targets(),
                        "probe round complete"
                    );
                }
            }
        }
    })
}
