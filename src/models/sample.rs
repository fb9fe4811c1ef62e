// Point-in-time host observation (live channel only, never persisted raw)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix seconds at collection time.
    pub timestamp: i64,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    #[serde(default)]
    pub disks: Vec<DiskStats>,
    pub network: NetworkStats,
    pub load_average: LoadAverage,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
    pub kernel: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage: f64,
    pub cores: u32,
    #[serde(default)]
    pub brand: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub usage_percent: f64,
    #[serde(default)]
    pub swap_total: u64,
    #[serde(default)]
    pub swap_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub name: String,
    pub mount: String,
    pub total: u64,
    pub used: u64,
    pub usage_percent: f64,
}

/// Interface counters summed over all non-loopback interfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_rx: u64,
    pub total_tx: u64,
    #[serde(default)]
    pub rx_speed: f64,
    #[serde(default)]
    pub tx_speed: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl Sample {
    /// Usage of the root mount, or the first disk when no root mount is reported.
    pub fn disk_usage(&self) -> f64 {
        self.disks
            .iter()
            .find(|d| d.mount == "/")
            .or_else(|| self.disks.first())
            .map(|d| d.usage_percent)
            .unwrap_or(0.0)
    }
}
