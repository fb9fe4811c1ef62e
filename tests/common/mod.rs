// Shared test helpers
#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use vstats::clock::Clock;
use vstats::models::*;

/// Sample at `timestamp` with the given CPU usage; other metrics fixed.
pub fn sample(timestamp: i64, cpu: f64) -> Sample {
    Sample {
        timestamp,
        hostname: "test-host".into(),
        os: None,
        cpu: CpuStats {
            usage: cpu,
            cores: 4,
            brand: "test".into(),
        },
        memory: MemoryStats {
            total: 1024,
            used: 512,
            available: 512,
            usage_percent: 50.0,
            swap_total: 0,
            swap_used: 0,
        },
        disks: vec![DiskStats {
            name: "sda1".into(),
            mount: "/".into(),
            total: 100,
            used: 25,
            usage_percent: 25.0,
        }],
        network: NetworkStats {
            total_rx: 1_000 + timestamp.max(0) as u64,
            total_tx: 500,
            rx_speed: 0.0,
            tx_speed: 0.0,
        },
        load_average: LoadAverage {
            one: 0.5,
            five: 0.4,
            fifteen: 0.3,
        },
        uptime: 100,
        version: None,
    }
}

/// A closed metric bucket holding `samples` samples of 10% CPU.
pub fn bucket(index: i64, samples: u32) -> Bucket {
    let mut b = Bucket::new(index);
    for _ in 0..samples {
        b.add(&sample(0, 10.0));
    }
    b
}

pub fn ping_bucket(index: i64, name: &str, ok: u32, fail: u32) -> PingBucket {
    let mut b = PingBucket::new(index, name, "192.0.2.1");
    for _ in 0..ok {
        b.add(&ProbeResult {
            name: name.into(),
            host: "192.0.2.1".into(),
            latency_ms: Some(12.0),
            packet_loss: 0.0,
            status: ProbeStatus::Ok,
        });
    }
    for _ in 0..fail {
        b.add(&ProbeResult {
            name: name.into(),
            host: "192.0.2.1".into(),
            latency_ms: None,
            packet_loss: 100.0,
            status: ProbeStatus::Timeout,
        });
    }
    b
}

pub fn target(name: &str, host: &str) -> PingTargetConfig {
    PingTargetConfig {
        name: name.into(),
        host: host.into(),
        kind: ProbeKind::Icmp,
        port: None,
    }
}

/// Clock whose wall time and monotonic time only move when told to.
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
    unix: AtomicI64,
}

impl ManualClock {
    pub fn new(unix: i64) -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            unix: AtomicI64::new(unix),
        }
    }

    pub fn set_unix(&self, unix: i64) {
        self.unix.store(unix, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap() += by;
        self.unix.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.elapsed.lock().unwrap()
    }

    fn unix_now(&self) -> i64 {
        self.unix.load(Ordering::SeqCst)
    }
}
