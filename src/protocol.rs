// Agent <-> ingestion wire protocol: text-framed JSON tagged by "type"

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Bucket, Granularity, PingBucket, PingTargetConfig, Sample};

/// Highest acknowledged bucket index per lane.
pub type LastBuckets = BTreeMap<Granularity, i64>;

/// Messages sent by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Auth {
        server_id: String,
        token: String,
        version: String,
    },
    Metrics {
        metrics: Sample,
    },
    AggregatedMetrics(AggregatedMetrics),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub batch_id: String,
    pub granularities: Vec<GranularityBatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<Sample>,
}

impl AggregatedMetrics {
    /// Metric plus ping buckets carried by the batch, decodable or not.
    pub fn bucket_count(&self) -> usize {
        self.granularities
            .iter()
            .map(|g| g.metrics.len() + g.ping.len())
            .sum()
    }
}

/// Closed buckets of one lane. The granularity stays a string on the wire so an
/// unknown lane is rejected per bucket instead of failing the whole message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GranularityBatch {
    pub granularity: String,
    #[serde(alias = "interval")]
    pub interval_seconds: i64,
    #[serde(default)]
    pub metrics: Vec<Lenient<Bucket>>,
    #[serde(default)]
    pub ping: Vec<Lenient<PingBucket>>,
}

impl GranularityBatch {
    pub fn new(granularity: Granularity, metrics: Vec<Bucket>, ping: Vec<PingBucket>) -> Self {
        Self {
            granularity: granularity.as_str().to_string(),
            interval_seconds: granularity.interval_secs(),
            metrics: metrics.into_iter().map(Lenient::Parsed).collect(),
            ping: ping.into_iter().map(Lenient::Parsed).collect(),
        }
    }
}

/// An item that either decoded as `T` or is kept as raw JSON so it can be counted as rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lenient<T> {
    Parsed(T),
    Malformed(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ok,
    Error,
}

/// Messages sent by the ingestion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Auth {
        status: AuthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ping_targets: Option<Vec<PingTargetConfig>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<String>,
        #[serde(default)]
        last_buckets: LastBuckets,
    },
    BatchAck(BatchAck),
    Config {
        ping_targets: Vec<PingTargetConfig>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn auth_error(message: impl Into<String>) -> Self {
        ServerMessage::Auth {
            status: AuthStatus::Error,
            message: Some(message.into()),
            ping_targets: None,
            last_seen: None,
            last_buckets: LastBuckets::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: String,
    pub accepted: usize,
    pub rejected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub last_buckets: LastBuckets,
}

/// Fanned out to dashboard subscribers for every live sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub server_id: String,
    pub received_at: i64,
    pub metrics: Sample,
}

/// Frames sent on /ws/dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    Snapshot { agents: Vec<LiveUpdate> },
    Metrics(LiveUpdate),
}

/// Unix seconds of the newest bucket end in `last_buckets`, formatted RFC 3339.
pub fn last_seen_from(last_buckets: &LastBuckets) -> Option<String> {
    last_buckets
        .iter()
        .map(|(g, index)| g.bucket_end(*index))
        .max()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339())
}
