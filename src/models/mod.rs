// Domain models shared by the agent and the ingestion service

mod bucket;
mod granularity;
mod ping;
mod sample;

pub use bucket::{Bucket, PingBucket};
pub use granularity::{Granularity, UnknownGranularity};
pub use ping::{DEFAULT_TCP_PORT, PingTargetConfig, ProbeKind, ProbeResult, ProbeStatus};
pub use sample::{CpuStats, DiskStats, LoadAverage, MemoryStats, NetworkStats, OsInfo, Sample};
