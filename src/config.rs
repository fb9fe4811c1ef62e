// TOML configuration for the ingestion server (CONFIG_FILE) and the agent (AGENT_CONFIG_FILE)

use serde::Deserialize;
use std::time::Duration;

use crate::models::PingTargetConfig;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub probe: ServerProbeConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// How often to log app stats (connected agents, dashboard clients, batches) at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishingConfig {
    /// Live updates kept in the broadcast channel for /ws/dashboard (slow clients may lag).
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Agents silent for longer than this are disconnected.
    #[serde(default = "default_server_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    /// Buckets may start at most this far past the server clock.
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_timeout_secs: default_server_keepalive_timeout_secs(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    #[serde(default)]
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    #[serde(default = "default_vacuum_interval_secs")]
    pub vacuum_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            prune_interval_secs: default_prune_interval_secs(),
            vacuum_schedule: None,
            vacuum_interval_secs: default_vacuum_interval_secs(),
        }
    }
}

/// Targets pushed to every agent ahead of its own list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerProbeConfig {
    #[serde(default)]
    pub ping_targets: Vec<PingTargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub server_id: String,
    pub token: String,
    #[serde(default)]
    pub ping_targets: Vec<PingTargetConfig>,
}

fn default_stats_log_interval_secs() -> u64 {
    60
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_server_keepalive_timeout_secs() -> u64 {
    90
}

fn default_max_clock_skew_secs() -> i64 {
    300
}

fn default_prune_interval_secs() -> u64 {
    600
}

fn default_vacuum_interval_secs() -> u64 {
    86_400
}

fn validate_targets(section: &str, targets: &[PingTargetConfig]) -> anyhow::Result<()> {
    for (i, t) in targets.iter().enumerate() {
        anyhow::ensure!(
            !t.name.trim().is_empty(),
            "{}[{}].name must be non-empty",
            section,
            i
        );
        anyhow::ensure!(
            !t.host.trim().is_empty(),
            "{}[{}].host must be non-empty",
            section,
            i
        );
    }
    Ok(())
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            self.server.stats_log_interval_secs > 0,
            "server.stats_log_interval_secs must be > 0, got {}",
            self.server.stats_log_interval_secs
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.max_pool_size > 0,
            "database.max_pool_size must be > 0, got {}",
            self.database.max_pool_size
        );
        anyhow::ensure!(
            self.publishing.broadcast_capacity > 0,
            "publishing.broadcast_capacity must be > 0, got {}",
            self.publishing.broadcast_capacity
        );
        anyhow::ensure!(
            self.ingest.auth_timeout_secs > 0,
            "ingest.auth_timeout_secs must be > 0, got {}",
            self.ingest.auth_timeout_secs
        );
        anyhow::ensure!(
            self.ingest.keepalive_interval_secs > 0,
            "ingest.keepalive_interval_secs must be > 0, got {}",
            self.ingest.keepalive_interval_secs
        );
        anyhow::ensure!(
            self.ingest.keepalive_timeout_secs > self.ingest.keepalive_interval_secs,
            "ingest.keepalive_timeout_secs must be > ingest.keepalive_interval_secs, got {}",
            self.ingest.keepalive_timeout_secs
        );
        anyhow::ensure!(
            self.ingest.max_clock_skew_secs >= 0,
            "ingest.max_clock_skew_secs must be >= 0, got {}",
            self.ingest.max_clock_skew_secs
        );
        anyhow::ensure!(
            self.retention.prune_interval_secs > 0,
            "retention.prune_interval_secs must be > 0, got {}",
            self.retention.prune_interval_secs
        );
        anyhow::ensure!(
            self.retention.vacuum_interval_secs > 0,
            "retention.vacuum_interval_secs must be > 0, got {}",
            self.retention.vacuum_interval_secs
        );
        validate_targets("probe.ping_targets", &self.probe.ping_targets)?;
        let mut seen = std::collections::HashSet::new();
        for (i, agent) in self.agents.iter().enumerate() {
            anyhow::ensure!(
                !agent.server_id.is_empty(),
                "agents[{}].server_id must be non-empty",
                i
            );
            anyhow::ensure!(
                !agent.token.is_empty(),
                "agents[{}].token must be non-empty",
                i
            );
            anyhow::ensure!(
                seen.insert(agent.server_id.as_str()),
                "agents[{}].server_id {:?} is listed twice",
                i,
                agent.server_id
            );
            validate_targets(&format!("agents[{}].ping_targets", i), &agent.ping_targets)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub probe: AgentProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// WebSocket endpoint of the ingestion service, e.g. ws://host:8081/ws/agent
    pub server_url: String,
    pub server_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// How often to log pipeline stats at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_live_interval_ms")]
    pub live_interval_ms: u64,
    #[serde(default = "default_batch_interval_secs")]
    pub batch_interval_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_agent_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_batch_buckets")]
    pub max_batch_buckets: usize,
    /// Closed buckets retained per lane while the server is unreachable.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            live_interval_ms: default_live_interval_ms(),
            batch_interval_secs: default_batch_interval_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_timeout_secs: default_agent_keepalive_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            max_batch_buckets: default_max_batch_buckets(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentProbeConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub targets: Vec<PingTargetConfig>,
}

impl Default for AgentProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval_secs(),
            timeout_ms: default_probe_timeout_ms(),
            targets: Vec::new(),
        }
    }
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_live_interval_ms() -> u64 {
    1_000
}

fn default_batch_interval_secs() -> u64 {
    60
}

fn default_agent_keepalive_timeout_secs() -> u64 {
    60
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_initial_backoff_secs() -> u64 {
    5
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_max_batch_buckets() -> usize {
    200
}

fn default_buffer_capacity() -> usize {
    1_440
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("AGENT_CONFIG_FILE").unwrap_or_else(|_| "agent.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.agent.server_url.starts_with("ws://") || self.agent.server_url.starts_with("wss://"),
            "agent.server_url must start with ws:// or wss://, got {}",
            self.agent.server_url
        );
        anyhow::ensure!(
            !self.agent.server_id.is_empty(),
            "agent.server_id must be non-empty"
        );
        anyhow::ensure!(!self.agent.token.is_empty(), "agent.token must be non-empty");
        anyhow::ensure!(
            self.sampling.sample_interval_ms > 0,
            "sampling.sample_interval_ms must be > 0, got {}",
            self.sampling.sample_interval_ms
        );
        anyhow::ensure!(
            self.sampling.stats_log_interval_secs > 0,
            "sampling.stats_log_interval_secs must be > 0, got {}",
            self.sampling.stats_log_interval_secs
        );
        let s = &self.sync;
        for (name, value) in [
            ("sync.live_interval_ms", s.live_interval_ms),
            ("sync.batch_interval_secs", s.batch_interval_secs),
            ("sync.keepalive_interval_secs", s.keepalive_interval_secs),
            ("sync.ack_timeout_secs", s.ack_timeout_secs),
            ("sync.auth_timeout_secs", s.auth_timeout_secs),
            ("sync.initial_backoff_secs", s.initial_backoff_secs),
        ] {
            anyhow::ensure!(value > 0, "{} must be > 0, got {}", name, value);
        }
        anyhow::ensure!(
            s.keepalive_timeout_secs >= s.keepalive_interval_secs,
            "sync.keepalive_timeout_secs must be >= sync.keepalive_interval_secs, got {}",
            s.keepalive_timeout_secs
        );
        anyhow::ensure!(
            s.max_backoff_secs >= s.initial_backoff_secs,
            "sync.max_backoff_secs must be >= sync.initial_backoff_secs, got {}",
            s.max_backoff_secs
        );
        anyhow::ensure!(
            s.max_batch_buckets > 0,
            "sync.max_batch_buckets must be > 0, got {}",
            s.max_batch_buckets
        );
        anyhow::ensure!(
            s.buffer_capacity > 0,
            "sync.buffer_capacity must be > 0, got {}",
            s.buffer_capacity
        );
        anyhow::ensure!(
            self.probe.interval_secs > 0,
            "probe.interval_secs must be > 0, got {}",
            self.probe.interval_secs
        );
        anyhow::ensure!(
            self.probe.timeout_ms > 0,
            "probe.timeout_ms must be > 0, got {}",
            self.probe.timeout_ms
        );
        validate_targets("probe.targets", &self.probe.targets)?;
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        let s = &self.sync;
        SyncConfig {
            url: self.agent.server_url.clone(),
            server_id: self.agent.server_id.clone(),
            token: self.agent.token.clone(),
            live_interval: Duration::from_millis(s.live_interval_ms),
            batch_interval: Duration::from_secs(s.batch_interval_secs),
            keepalive_interval: Duration::from_secs(s.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(s.keepalive_timeout_secs),
            ack_timeout: Duration::from_secs(s.ack_timeout_secs),
            auth_timeout: Duration::from_secs(s.auth_timeout_secs),
            initial_backoff: Duration::from_secs(s.initial_backoff_secs),
            max_backoff: Duration::from_secs(s.max_backoff_secs),
            max_batch_buckets: s.max_batch_buckets,
            buffer_capacity: s.buffer_capacity,
        }
    }
}
