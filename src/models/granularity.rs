// Rollup granularities and interval-index math

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One of the five independent rollup lanes. Every lane ingests raw samples directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "5sec")]
    FiveSec,
    #[serde(rename = "2min")]
    TwoMin,
    #[serde(rename = "15min")]
    FifteenMin,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "daily")]
    Daily,
}

impl Granularity {
    /// All lanes, finest first. Lane arrays are indexed in this order.
    pub const ALL: [Granularity; 5] = [
        Granularity::FiveSec,
        Granularity::TwoMin,
        Granularity::FifteenMin,
        Granularity::Hourly,
        Granularity::Daily,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::FiveSec => "5sec",
            Granularity::TwoMin => "2min",
            Granularity::FifteenMin => "15min",
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }

    pub fn interval_secs(self) -> i64 {
        match self {
            Granularity::FiveSec => 5,
            Granularity::TwoMin => 120,
            Granularity::FifteenMin => 900,
            Granularity::Hourly => 3_600,
            Granularity::Daily => 86_400,
        }
    }

    /// How long the ingestion side keeps buckets of this lane.
    pub fn retention(self) -> Duration {
        let hours: u64 = match self {
            Granularity::FiveSec => 2,
            Granularity::TwoMin => 26,
            Granularity::FifteenMin => 8 * 24,
            Granularity::Hourly => 32 * 24,
            Granularity::Daily => 400 * 24,
        };
        Duration::from_secs(hours * 3_600)
    }

    /// Position in [`Granularity::ALL`].
    pub fn lane(self) -> usize {
        match self {
            Granularity::FiveSec => 0,
            Granularity::TwoMin => 1,
            Granularity::FifteenMin => 2,
            Granularity::Hourly => 3,
            Granularity::Daily => 4,
        }
    }

    /// `floor(timestamp / interval)`; negative timestamps floor toward -inf.
    pub fn index_for(self, unix_secs: i64) -> i64 {
        unix_secs.div_euclid(self.interval_secs())
    }

    pub fn bucket_start(self, index: i64) -> i64 {
        index.saturating_mul(self.interval_secs())
    }

    pub fn bucket_end(self, index: i64) -> i64 {
        self.bucket_start(index.saturating_add(1))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown granularity {0:?}")]
pub struct UnknownGranularity(pub String);

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| UnknownGranularity(s.to_string()))
    }
}
