// Ping targets and probe results

use serde::{Deserialize, Serialize};

pub const DEFAULT_TCP_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Icmp,
    Tcp,
}

/// A named probe target. Pushed by the server or listed in agent config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingTargetConfig {
    pub name: String,
    pub host: String,
    #[serde(default, rename = "type")]
    pub kind: ProbeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl PingTargetConfig {
    pub fn tcp_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TCP_PORT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub host: String,
    pub latency_ms: Option<f64>,
    /// Percentage in `[0, 100]`.
    pub packet_loss: f64,
    pub status: ProbeStatus,
}

impl ProbeResult {
    pub fn failed(target: &PingTargetConfig, status: ProbeStatus) -> Self {
        Self {
            name: target.name.clone(),
            host: target.host.clone(),
            latency_ms: None,
            packet_loss: 100.0,
            status,
        }
    }
}
