// Host metrics sampling via sysinfo

mod linux;

use crate::models::{CpuStats, DiskStats, LoadAverage, MemoryStats, NetworkStats, OsInfo, Sample};
use crate::version::VERSION;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use sysinfo::{Disks, Networks, System};
use tracing::instrument;

/// Produces [`Sample`]s. The sampling worker only depends on this seam.
pub trait Collector: Send + Sync + 'static {
    /// Collects one sample stamped with `timestamp` (unix seconds from the worker's clock).
    fn sample(&self, timestamp: i64)
    -> impl std::future::Future<Output = anyhow::Result<Sample>> + Send;
}

struct SysinfoState {
    sys: System,
    disks: Disks,
    networks: Networks,
    last_network: Option<(u64, u64, Instant)>,
}

pub struct SysinfoCollector {
    state: Arc<Mutex<SysinfoState>>,
    os: Option<OsInfo>,
    hostname: String,
}

impl Default for SysinfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        let os = Some(OsInfo {
            name: linux::read_os_pretty_name()
                .or_else(System::name)
                .unwrap_or_else(|| std::env::consts::OS.into()),
            version: System::os_version().unwrap_or_default(),
            kernel: System::kernel_version().unwrap_or_default(),
            arch: System::cpu_arch(),
        });
        Self {
            state: Arc::new(Mutex::new(SysinfoState {
                sys,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
                last_network: None,
            })),
            os,
            hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
        }
    }
}

impl Collector for SysinfoCollector {
    #[instrument(skip(self), fields(collector = "sysinfo", operation = "sample"))]
    async fn sample(&self, timestamp: i64) -> anyhow::Result<Sample> {
        let state = self.state.clone();
        let os = self.os.clone();
        let hostname = self.hostname.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            let st = &mut *guard;
            st.sys.refresh_cpu_all();
            st.sys.refresh_memory();
            st.disks.refresh(false);
            st.networks.refresh(true);

            let cpu = CpuStats {
                usage: (st.sys.global_cpu_usage() as f64).clamp(0.0, 100.0),
                cores: st.sys.cpus().len() as u32,
                brand: st
                    .sys
                    .cpus()
                    .first()
                    .map(|c| c.brand().trim().to_string())
                    .filter(|b| !b.is_empty())
                    .or_else(linux::read_cpu_model)
                    .unwrap_or_else(|| "Unknown".into()),
            };

            let total = st.sys.total_memory();
            let available = st.sys.available_memory();
            let used = total.saturating_sub(available);
            let memory = MemoryStats {
                total,
                used,
                available,
                usage_percent: percent(used, total),
                swap_total: st.sys.total_swap(),
                swap_used: st.sys.used_swap(),
            };

            let disks = st
                .disks
                .list()
                .iter()
                .filter(|d| d.total_space() > 0)
                .map(|d| {
                    let total = d.total_space();
                    let used = total.saturating_sub(d.available_space());
                    DiskStats {
                        name: d.name().to_string_lossy().into_owned(),
                        mount: d.mount_point().to_string_lossy().into_owned(),
                        total,
                        used,
                        usage_percent: percent(used, total),
                    }
                })
                .collect();

            let (total_rx, total_tx) = st
                .networks
                .list()
                .iter()
                .filter(|(name, _)| !linux::is_ignored_interface(name))
                .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                    (
                        rx.saturating_add(data.total_received()),
                        tx.saturating_add(data.total_transmitted()),
                    )
                });
            let now = Instant::now();
            let (rx_speed, tx_speed) = match st.last_network {
                Some((prev_rx, prev_tx, prev_ts)) => {
                    let dt = now.duration_since(prev_ts).as_secs_f64();
                    if dt > 0.0 {
                        (
                            total_rx.saturating_sub(prev_rx) as f64 / dt,
                            total_tx.saturating_sub(prev_tx) as f64 / dt,
                        )
                    } else {
                        (0.0, 0.0)
                    }
                }
                None => (0.0, 0.0),
            };
            st.last_network = Some((total_rx, total_tx, now));

            let load = System::load_average();
            Ok(Sample {
                timestamp,
                hostname,
                os,
                cpu,
                memory,
                disks,
                network: NetworkStats {
                    total_rx,
                    total_tx,
                    rx_speed,
                    tx_speed,
                },
                load_average: LoadAverage {
                    one: load.one,
                    five: load.five,
                    fifteen: load.fifteen,
                },
                uptime: System::uptime(),
                version: Some(VERSION.to_string()),
            })
        })
        .await
        .map_err(|e| anyhow::anyhow!("sysinfo task join: {}", e))?
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}
