// ICMP probe via the system ping command, plus its output parser

use std::time::Duration;

use tokio::process::Command;

use crate::models::{PingTargetConfig, ProbeResult, ProbeStatus};

const ECHO_COUNT: &str = "3";

/// Loss and average round trip pulled out of ping's summary lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PingSummary {
    pub packet_loss: Option<f64>,
    pub avg_ms: Option<f64>,
}

impl PingSummary {
    pub fn status(&self) -> ProbeStatus {
        if self.packet_loss.is_some_and(|loss| loss >= 100.0) {
            ProbeStatus::Timeout
        } else if self.avg_ms.is_some() {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Error
        }
    }
}

/// Parses Linux (iputils/busybox), macOS and Windows ping summaries.
pub fn parse_ping_output(output: &str) -> PingSummary {
    let mut summary = PingSummary::default();
    for line in output.lines() {
        if summary.packet_loss.is_none() && (line.contains("packet loss") || line.contains("% loss"))
        {
            summary.packet_loss = percent_before_sign(line);
        }
        if summary.avg_ms.is_none() {
            summary.avg_ms = slash_separated_avg(line).or_else(|| windows_average(line));
        }
    }
    summary
}

/// Number immediately before the first '%', e.g. "0.0% packet loss" or "(100% loss)".
fn percent_before_sign(line: &str) -> Option<f64> {
    let end = line.find('%')?;
    let head = &line[..end];
    let start = head
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|i| i + 1)
        .unwrap_or(0);
    head[start..].parse().ok()
}

/// "rtt min/avg/max/mdev = 0.045/0.050/0.056/0.004 ms" -> 0.050
fn slash_separated_avg(line: &str) -> Option<f64> {
    if !line.contains("min/avg/max") {
        return None;
    }
    let values = line.split('=').nth(1)?.split_whitespace().next()?;
    values.split('/').nth(1)?.parse().ok()
}

/// "Minimum = 1ms, Maximum = 2ms, Average = 1ms" -> 1
fn windows_average(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("Average =")?;
    rest.trim().trim_end_matches("ms").trim().parse().ok()
}

fn ping_command(host: &str) -> Command {
    let mut cmd = Command::new("ping");
    #[cfg(target_os = "windows")]
    cmd.args(["-n", ECHO_COUNT, "-w", "2000", host]);
    #[cfg(target_os = "macos")]
    cmd.args(["-c", ECHO_COUNT, "-W", "2000", host]);
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    cmd.args(["-c", ECHO_COUNT, "-W", "2", host]);
    cmd.kill_on_drop(true);
    cmd
}

pub(super) async fn probe(target: &PingTargetConfig, timeout: Duration) -> ProbeResult {
    let output = match tokio::time::timeout(timeout, ping_command(&target.host).output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!(
                error = %e,
                operation = "icmp_probe",
                host = %target.host,
                "ping command failed"
            );
            return ProbeResult::failed(target, ProbeStatus::Error);
        }
        Err(_) => return ProbeResult::failed(target, ProbeStatus::Timeout),
    };
    let summary = parse_ping_output(&String::from_utf8_lossy(&output.stdout));
    let status = summary.status();
    ProbeResult {
        name: target.name.clone(),
        host: target.host.clone(),
        latency_ms: summary.avg_ms.filter(|_| status == ProbeStatus::Ok),
        packet_loss: summary.packet_loss.unwrap_or(100.0),
        status,
    }
}
