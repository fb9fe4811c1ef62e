// Rollup buckets: sum/max/count per interval; averages derived on read

use serde::{Deserialize, Serialize};

use super::{ProbeResult, ProbeStatus, Sample};

/// Aggregate of every sample whose timestamp fell in one interval of one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(rename = "bucket")]
    pub index: i64,
    pub cpu_sum: f64,
    pub cpu_max: f64,
    pub memory_sum: f64,
    pub memory_max: f64,
    pub disk_sum: f64,
    pub disk_max: f64,
    pub load_sum: f64,
    pub load_max: f64,
    /// Highest cumulative receive counter seen in the interval.
    pub net_rx: u64,
    pub net_tx: u64,
    pub sample_count: u32,
}

impl Bucket {
    pub fn new(index: i64) -> Self {
        Self {
            index,
            cpu_sum: 0.0,
            cpu_max: 0.0,
            memory_sum: 0.0,
            memory_max: 0.0,
            disk_sum: 0.0,
            disk_max: 0.0,
            load_sum: 0.0,
            load_max: 0.0,
            net_rx: 0,
            net_tx: 0,
            sample_count: 0,
        }
    }

    pub fn add(&mut self, sample: &Sample) {
        let cpu = sample.cpu.usage;
        let memory = sample.memory.usage_percent;
        let disk = sample.disk_usage();
        let load = sample.load_average.one;

        self.cpu_sum += cpu;
        self.cpu_max = self.cpu_max.max(cpu);
        self.memory_sum += memory;
        self.memory_max = self.memory_max.max(memory);
        self.disk_sum += disk;
        self.disk_max = self.disk_max.max(disk);
        self.load_sum += load;
        self.load_max = self.load_max.max(load);
        self.net_rx = self.net_rx.max(sample.network.total_rx);
        self.net_tx = self.net_tx.max(sample.network.total_tx);
        self.sample_count += 1;
    }

    fn avg(&self, sum: f64) -> Option<f64> {
        (self.sample_count > 0).then(|| sum / self.sample_count as f64)
    }

    pub fn cpu_avg(&self) -> Option<f64> {
        self.avg(self.cpu_sum)
    }

    pub fn memory_avg(&self) -> Option<f64> {
        self.avg(self.memory_sum)
    }

    pub fn disk_avg(&self) -> Option<f64> {
        self.avg(self.disk_sum)
    }

    pub fn load_avg(&self) -> Option<f64> {
        self.avg(self.load_sum)
    }

    /// Every float aggregate, for validation.
    pub fn aggregates(&self) -> [f64; 8] {
        [
            self.cpu_sum,
            self.cpu_max,
            self.memory_sum,
            self.memory_max,
            self.disk_sum,
            self.disk_max,
            self.load_sum,
            self.load_max,
        ]
    }
}

/// Probe outcomes for one target in one interval of one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingBucket {
    #[serde(rename = "bucket")]
    pub index: i64,
    pub target_name: String,
    pub target_host: String,
    pub latency_sum: f64,
    pub latency_max: f64,
    pub latency_count: u32,
    pub ok_count: u32,
    pub fail_count: u32,
}

impl PingBucket {
    pub fn new(index: i64, target_name: &str, target_host: &str) -> Self {
        Self {
            index,
            target_name: target_name.to_string(),
            target_host: target_host.to_string(),
            latency_sum: 0.0,
            latency_max: 0.0,
            latency_count: 0,
            ok_count: 0,
            fail_count: 0,
        }
    }

    pub fn add(&mut self, result: &ProbeResult) {
        if let Some(latency) = result.latency_ms {
            self.latency_sum += latency;
            self.latency_max = self.latency_max.max(latency);
            self.latency_count += 1;
        }
        if result.status == ProbeStatus::Ok {
            self.ok_count += 1;
        } else {
            self.fail_count += 1;
        }
    }

    /// Number of probes recorded, successful or not. Ping merge precedence compares this.
    pub fn probes(&self) -> u32 {
        self.ok_count.saturating_add(self.fail_count)
    }

    pub fn latency_avg(&self) -> Option<f64> {
        (self.latency_count > 0).then(|| self.latency_sum / self.latency_count as f64)
    }

    /// Fraction of successful probes in `[0, 1]`.
    pub fn availability(&self) -> Option<f64> {
        let probes = self.probes();
        (probes > 0).then(|| self.ok_count as f64 / probes as f64)
    }
}
