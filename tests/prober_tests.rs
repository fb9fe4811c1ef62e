// Prober tests: ping output parsing, target merging, TCP probes and probe rounds

mod common;

use common::{ManualClock, target};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vstats::aggregator::{ClosedQueue, PingAggregator};
use vstats::models::{Granularity, PingTargetConfig, ProbeKind, ProbeStatus};
use vstats::prober::icmp::parse_ping_output;
use vstats::prober::{self, ProberDeps, TargetSet, merge_targets};
use vstats::stats::PipelineStats;

const LINUX_OK: &str = "\
PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.
64 bytes from 192.0.2.1: icmp_seq=1 ttl=64 time=0.045 ms

--- 192.0.2.1 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 0.045/0.050/0.056/0.004 ms
";

const LINUX_DOWN: &str = "\
--- 192.0.2.9 ping statistics ---
3 packets transmitted, 0 received, 100% packet loss, time 2049ms
";

const MACOS_PARTIAL: &str = "\
--- example.com ping statistics ---
3 packets transmitted, 2 packets received, 33.3% packet loss
round-trip min/avg/max/stddev = 10.100/12.500/14.900/2.400 ms
";

const WINDOWS_OK: &str = "\
Ping statistics for 192.0.2.1:
    Packets: Sent = 3, Received = 3, Lost = 0 (0% loss),
Approximate round trip times in milli-seconds:
    Minimum = 1ms, Maximum = 2ms, Average = 1ms
";

#[test]
fn parses_linux_summary() {
    let s = parse_ping_output(LINUX_OK);
    assert_eq!(s.packet_loss, Some(0.0));
    assert_eq!(s.avg_ms, Some(0.050));
    assert_eq!(s.status(), ProbeStatus::Ok);
}

#[test]
fn total_loss_is_timeout() {
    let s = parse_ping_output(LINUX_DOWN);
    assert_eq!(s.packet_loss, Some(100.0));
    assert_eq!(s.avg_ms, None);
    assert_eq!(s.status(), ProbeStatus::Timeout);
}

#[test]
fn parses_macos_and_windows_summaries() {
    let mac = parse_ping_output(MACOS_PARTIAL);
    assert_eq!(mac.packet_loss, Some(33.3));
    assert_eq!(mac.avg_ms, Some(12.5));

    let win = parse_ping_output(WINDOWS_OK);
    assert_eq!(win.packet_loss, Some(0.0));
    assert_eq!(win.avg_ms, Some(1.0));
}

#[test]
fn garbage_output_is_error() {
    assert_eq!(
        parse_ping_output("ping: unknown host nowhere").status(),
        ProbeStatus::Error
    );
}

#[test]
fn merge_dedupes_by_host_and_name() {
    let defaults = vec![target("gw", "192.0.2.1"), target("dns", "192.0.2.53")];
    let custom = vec![
        target("gateway", "192.0.2.1"),
        target("dns", "198.51.100.1"),
        target("cdn", "Example.COM"),
        target("cdn2", "example.com"),
        target("blank", "  "),
    ];
    let merged: Vec<_> = merge_targets(&defaults, &custom)
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(merged, vec!["gw", "dns", "cdn"]);
}

#[test]
fn custom_targets_replace_previous_custom_list() {
    let set = TargetSet::new(vec![target("gw", "192.0.2.1")]);
    set.set_custom(vec![target("a", "192.0.2.10")]);
    set.set_custom(vec![target("b", "192.0.2.11")]);
    let names: Vec<_> = set.effective().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["gw", "b"]);
}

fn tcp_target(name: &str, port: u16) -> PingTargetConfig {
    PingTargetConfig {
        name: name.into(),
        host: "127.0.0.1".into(),
        kind: ProbeKind::Tcp,
        port: Some(port),
    }
}

async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn tcp_probe_reports_latency_or_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let ok = prober::probe(&tcp_target("open", open), Duration::from_secs(2)).await;
    assert_eq!(ok.status, ProbeStatus::Ok);
    assert!(ok.latency_ms.is_some());
    assert_eq!(ok.packet_loss, 0.0);

    let refused = prober::probe(&tcp_target("closed", closed_port().await), Duration::from_secs(2)).await;
    assert_eq!(refused.status, ProbeStatus::Error);
    assert_eq!(refused.latency_ms, None);
    assert_eq!(refused.packet_loss, 100.0);
}

#[tokio::test]
async fn probe_round_records_every_target() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let stats = Arc::new(PipelineStats::default());
    let queue = Arc::new(ClosedQueue::new(16, stats.clone()));
    let lanes = Arc::new(PingAggregator::new(queue, stats.clone()));
    let deps = ProberDeps {
        targets: Arc::new(TargetSet::new(vec![
            tcp_target("up", open),
            PingTargetConfig {
                host: "localhost".into(),
                ..tcp_target("down", closed_port().await)
            },
        ])),
        lanes: lanes.clone(),
        clock: Arc::new(ManualClock::new(600)),
        shutdown: CancellationToken::new(),
    };
    assert_eq!(prober::run_round(&deps, Duration::from_secs(2)).await, 2);
    assert_eq!(stats.snapshot().probes_recorded, 2);

    let up = lanes.open_bucket(Granularity::TwoMin, "up").unwrap();
    assert_eq!((up.ok_count, up.fail_count), (1, 0));
    let down = lanes.open_bucket(Granularity::TwoMin, "down").unwrap();
    assert_eq!((down.ok_count, down.fail_count), (0, 1));
    assert_eq!(down.index, Granularity::TwoMin.index_for(600));
}
