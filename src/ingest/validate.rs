// Per-bucket structural checks. A rejection never fails the surrounding batch.

use std::str::FromStr;

use crate::models::{Bucket, Granularity, PingBucket};
use crate::protocol::{GranularityBatch, Lenient};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("unknown granularity {0:?}")]
    UnknownGranularity(String),
    #[error("interval {got}s does not match {granularity} ({expected}s)")]
    IntervalMismatch {
        granularity: Granularity,
        expected: i64,
        got: i64,
    },
    #[error("undecodable bucket")]
    Malformed,
    #[error("bucket index {0} is negative")]
    NegativeIndex(i64),
    #[error("bucket {0} starts in the future")]
    FutureIndex(i64),
    #[error("bucket has no samples")]
    Empty,
    #[error("aggregate is negative or not finite")]
    InvalidAggregate,
    #[error("ping bucket has no target")]
    MissingTarget,
}

/// Resolves the lane of a granularity batch.
pub fn lane_of(batch: &GranularityBatch) -> Result<Granularity, Rejection> {
    let g = Granularity::from_str(&batch.granularity)
        .map_err(|e| Rejection::UnknownGranularity(e.0))?;
    if batch.interval_seconds != g.interval_secs() {
        return Err(Rejection::IntervalMismatch {
            granularity: g,
            expected: g.interval_secs(),
            got: batch.interval_seconds,
        });
    }
    Ok(g)
}

fn check_index(g: Granularity, index: i64, latest_start: i64) -> Result<(), Rejection> {
    if index < 0 {
        return Err(Rejection::NegativeIndex(index));
    }
    if g.bucket_start(index) > latest_start {
        return Err(Rejection::FutureIndex(index));
    }
    Ok(())
}

fn check_aggregate(v: f64) -> Result<(), Rejection> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(Rejection::InvalidAggregate)
    }
}

/// `latest_start` is the newest acceptable bucket start: now plus the clock-skew allowance.
pub fn validate_bucket(
    g: Granularity,
    item: &Lenient<Bucket>,
    latest_start: i64,
) -> Result<Bucket, Rejection> {
    let Lenient::Parsed(b) = item else {
        return Err(Rejection::Malformed);
    };
    check_index(g, b.index, latest_start)?;
    if b.sample_count == 0 {
        return Err(Rejection::Empty);
    }
    b.aggregates().into_iter().try_for_each(check_aggregate)?;
    Ok(b.clone())
}

pub fn validate_ping(
    g: Granularity,
    item: &Lenient<PingBucket>,
    latest_start: i64,
) -> Result<PingBucket, Rejection> {
    let Lenient::Parsed(p) = item else {
        return Err(Rejection::Malformed);
    };
    check_index(g, p.index, latest_start)?;
    if p.target_name.trim().is_empty() {
        return Err(Rejection::MissingTarget);
    }
    if p.probes() == 0 {
        return Err(Rejection::Empty);
    }
    check_aggregate(p.latency_sum)?;
    check_aggregate(p.latency_max)?;
    Ok(p.clone())
}
