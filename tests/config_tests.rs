// Config loading and validation tests (server and agent)

use std::time::Duration;
use vstats::config::{AgentConfig, AppConfig};
use vstats::models::ProbeKind;

const VALID_CONFIG: &str = r#"
[server]
port = 8081
host = "0.0.0.0"

[database]
path = "data/vstats.db"
max_pool_size = 10

[publishing]
broadcast_capacity = 60

[probe]
ping_targets = [{ name = "gateway", host = "192.0.2.1" }]

[[agents]]
server_id = "web-1"
token = "s3cret"

[[agents]]
server_id = "db-1"
token = "t0ken"
ping_targets = [{ name = "api", host = "api.example.com", type = "tcp", port = 443 }]
"#;

const VALID_AGENT_CONFIG: &str = r#"
[agent]
server_url = "ws://127.0.0.1:8081/ws/agent"
server_id = "web-1"
token = "s3cret"

[probe]
targets = [{ name = "dns", host = "1.1.1.1" }]
"#;

#[test]
fn test_config_loads_from_str() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("load_from_str");
    assert_eq!(config.server.port, 8081);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.database.path, "data/vstats.db");
    assert_eq!(config.publishing.broadcast_capacity, 60);
    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[1].ping_targets[0].kind, ProbeKind::Tcp);
    assert_eq!(config.agents[1].ping_targets[0].tcp_port(), 443);
}

#[test]
fn test_config_defaults_when_omitted() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("valid");
    assert_eq!(config.server.stats_log_interval_secs, 60);
    assert_eq!(config.ingest.auth_timeout_secs, 10);
    assert_eq!(config.ingest.keepalive_interval_secs, 30);
    assert_eq!(config.ingest.max_clock_skew_secs, 300);
    assert_eq!(config.retention.prune_interval_secs, 600);
    assert!(config.retention.vacuum_schedule.is_none());
}

#[test]
fn test_config_validation_rejects_invalid_port() {
    let bad = VALID_CONFIG.replace("port = 8081", "port = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("server.port"));
}

#[test]
fn test_config_validation_rejects_empty_db_path() {
    let bad = VALID_CONFIG.replace("path = \"data/vstats.db\"", "path = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("database.path"));
}

#[test]
fn test_config_validation_rejects_max_pool_size_zero() {
    let bad = VALID_CONFIG.replace("max_pool_size = 10", "max_pool_size = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("max_pool_size"));
}

#[test]
fn test_config_validation_rejects_broadcast_capacity_zero() {
    let bad = VALID_CONFIG.replace("broadcast_capacity = 60", "broadcast_capacity = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("broadcast_capacity"));
}

#[test]
fn test_config_validation_rejects_duplicate_agents() {
    let bad = VALID_CONFIG.replace("server_id = \"db-1\"", "server_id = \"web-1\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("listed twice"));
}

#[test]
fn test_config_validation_rejects_empty_agent_token() {
    let bad = VALID_CONFIG.replace("token = \"t0ken\"", "token = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("agents[1].token"));
}

#[test]
fn test_config_validation_rejects_blank_target_host() {
    let bad = VALID_CONFIG.replace("host = \"192.0.2.1\"", "host = \" \"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("probe.ping_targets[0].host"));
}

#[test]
fn test_config_validation_rejects_keepalive_timeout_below_interval() {
    let bad = format!("{VALID_CONFIG}\n[ingest]\nkeepalive_interval_secs = 30\nkeepalive_timeout_secs = 20\n");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("keepalive_timeout_secs"));
}

#[test]
fn test_config_validation_rejects_invalid_toml() {
    let err = AppConfig::load_from_str("not valid toml [[[").unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[test]
fn test_config_load_from_file_via_env() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, VALID_CONFIG).unwrap();
    unsafe { std::env::set_var("CONFIG_FILE", path.to_str().unwrap()) };
    let result = AppConfig::load();
    unsafe { std::env::remove_var("CONFIG_FILE") };
    let config = result.expect("load from CONFIG_FILE");
    assert_eq!(config.server.port, 8081);
    assert_eq!(config.database.path, "data/vstats.db");
}

#[test]
fn test_agent_config_defaults() {
    let config = AgentConfig::load_from_str(VALID_AGENT_CONFIG).expect("valid");
    assert_eq!(config.sampling.sample_interval_ms, 1000);
    assert_eq!(config.sync.batch_interval_secs, 60);
    assert_eq!(config.sync.max_backoff_secs, 60);
    assert_eq!(config.probe.interval_secs, 10);
    assert_eq!(config.probe.targets.len(), 1);

    let sync = config.sync_config();
    assert_eq!(sync.url, "ws://127.0.0.1:8081/ws/agent");
    assert_eq!(sync.initial_backoff, Duration::from_secs(5));
    assert_eq!(sync.auth_timeout, Duration::from_secs(10));
    assert_eq!(sync.live_interval, Duration::from_millis(1000));
}

#[test]
fn test_agent_config_rejects_http_url() {
    let bad = VALID_AGENT_CONFIG.replace("ws://", "http://");
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("agent.server_url"));
}

#[test]
fn test_agent_config_accepts_wss_url() {
    let tls = VALID_AGENT_CONFIG.replace("ws://127.0.0.1:8081", "wss://monitor.example.com");
    let config = AgentConfig::load_from_str(&tls).expect("wss is a supported scheme");
    assert_eq!(config.sync_config().url, "wss://monitor.example.com/ws/agent");
}

#[test]
fn test_agent_config_rejects_max_backoff_below_initial() {
    let bad = format!("{VALID_AGENT_CONFIG}\n[sync]\ninitial_backoff_secs = 30\nmax_backoff_secs = 10\n");
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("max_backoff_secs"));
}

#[test]
fn test_agent_config_load_from_file_via_env() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    std::fs::write(&path, VALID_AGENT_CONFIG).unwrap();
    unsafe { std::env::set_var("AGENT_CONFIG_FILE", path.to_str().unwrap()) };
    let result = AgentConfig::load();
    unsafe { std::env::remove_var("AGENT_CONFIG_FILE") };
    assert_eq!(result.expect("load from AGENT_CONFIG_FILE").agent.server_id, "web-1");
}
