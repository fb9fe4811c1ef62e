// Sync client: keeps one authenticated WebSocket to the ingestion service, streams live
// samples, drains closed buckets in acknowledged batches and reconnects with backoff.

mod outbox;
mod state;

pub use outbox::{AckMismatch, Outbox};
pub use state::{
    AUTH_TIMEOUT, Backoff, ConnectionState, DisconnectReason, INITIAL_BACKOFF, InvalidTransition,
    MAX_BACKOFF, SyncStateMachine,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::aggregator::ClosedQueue;
use crate::clock::Clock;
use crate::models::{PingTargetConfig, Sample};
use crate::prober::TargetSet;
use crate::protocol::{AgentMessage, AuthStatus, LastBuckets, ServerMessage};
use crate::stats::{PipelineStats, bump};
use crate::version::VERSION;

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("send timed out")]
    SendTimeout,
    #[error("no auth reply within {0:?}")]
    AuthTimeout(Duration),
    #[error("auth rejected: {0}")]
    AuthRejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no pong within {0:?}")]
    KeepaliveMissed(Duration),
    #[error("batch unacknowledged after {0:?}")]
    AckTimeout(Duration),
    #[error("connection closed by server")]
    Closed,
    #[error(transparent)]
    State(#[from] InvalidTransition),
}

impl SyncError {
    pub fn reason(&self) -> DisconnectReason {
        match self {
            SyncError::AuthTimeout(_) => DisconnectReason::AuthTimeout,
            SyncError::AuthRejected(_) => DisconnectReason::AuthRejected,
            SyncError::KeepaliveMissed(_) => DisconnectReason::KeepaliveMissed,
            SyncError::AckTimeout(_) => DisconnectReason::AckTimeout,
            SyncError::Closed => DisconnectReason::Closed,
            _ => DisconnectReason::Transport,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::AuthRejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// e.g. ws://monitor.example:8081/ws/agent
    pub url: String,
    pub server_id: String,
    pub token: String,
    pub live_interval: Duration,
    pub batch_interval: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub ack_timeout: Duration,
    pub auth_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_batch_buckets: usize,
    pub buffer_capacity: usize,
}

pub struct SyncDeps {
    pub queue: Arc<ClosedQueue>,
    pub live: watch::Receiver<Option<Sample>>,
    pub targets: Arc<TargetSet>,
    pub stats: Arc<PipelineStats>,
    pub clock: Arc<dyn Clock>,
}

pub struct SyncClient {
    config: SyncConfig,
    deps: SyncDeps,
    outbox: Outbox,
    machine: SyncStateMachine,
}

async fn send_message(sink: &mut WsSink, msg: Message) -> Result<(), SyncError> {
    match timeout(WS_SEND_TIMEOUT, sink.send(msg)).await {
        Ok(r) => r.map_err(SyncError::Transport),
        Err(_) => Err(SyncError::SendTimeout),
    }
}

async fn send_json(sink: &mut WsSink, msg: &AgentMessage) -> Result<(), SyncError> {
    let json = serde_json::to_string(msg)?;
    send_message(sink, Message::Text(json.into())).await
}

/// Makes rustls' ring provider the process default for `wss://` dials. A provider that is
/// already installed is left in place.
pub fn install_tls_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }
}

impl SyncClient {
    pub fn new(config: SyncConfig, deps: SyncDeps) -> Self {
        install_tls_provider();
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        let machine = SyncStateMachine::new(backoff, config.auth_timeout, deps.clock.now());
        let outbox = Outbox::new(config.buffer_capacity, deps.stats.clone());
        Self {
            config,
            deps,
            outbox,
            machine,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let span = tracing::span!(tracing::Level::DEBUG, "sync", server_id = %self.config.server_id);
        tokio::spawn(self.run(shutdown).instrument(span))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let wait = self.machine.retry_in(self.deps.clock.now());
            if !wait.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            if let Err(e) = self.machine.begin_connect(self.deps.clock.now()) {
                tracing::debug!(error = %e, "reconnect not due yet");
                continue;
            }

            match self.session(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    let reason = e.reason();
                    self.outbox.requeue_in_flight();
                    let delay = self.machine.disconnect(self.deps.clock.now(), reason);
                    bump(&self.deps.stats.disconnects, 1);
                    if e.is_auth() {
                        bump(&self.deps.stats.auth_failures, 1);
                        tracing::error!(
                            error = %e,
                            consecutive_failures = self.machine.consecutive_auth_failures(),
                            retry_in_secs = delay.as_secs(),
                            "authentication rejected"
                        );
                    } else {
                        tracing::warn!(
                            error = %e,
                            reason = %reason,
                            pending_buckets = self.outbox.pending_len(),
                            retry_in_secs = delay.as_secs(),
                            "sync connection lost"
                        );
                    }
                }
            }
        }
        tracing::info!("Sync client shutting down");
    }

    /// One connection from dial to drop. `Ok` only when shutdown was requested.
    async fn session(&mut self, shutdown: &CancellationToken) -> Result<(), SyncError> {
        let connect = timeout(self.config.auth_timeout, connect_async(self.config.url.as_str()));
        let (ws, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = connect => connected
                .map_err(|_| SyncError::ConnectTimeout)?
                .map_err(SyncError::Connect)?,
        };
        self.machine.transport_established(self.deps.clock.now())?;
        let (mut sink, mut stream) = ws.split();

        send_json(
            &mut sink,
            &AgentMessage::Auth {
                server_id: self.config.server_id.clone(),
                token: self.config.token.clone(),
                version: VERSION.to_string(),
            },
        )
        .await?;

        let Some((targets, last_buckets)) = self.await_auth(&mut stream, shutdown).await? else {
            return Ok(());
        };
        self.machine.auth_accepted(self.deps.clock.now())?;
        if let Some(targets) = targets {
            self.deps.targets.set_custom(targets);
        }
        let resume = self.outbox.resume(&last_buckets);
        tracing::info!(
            url = %self.config.url,
            resume = ?resume,
            pending_buckets = self.outbox.pending_len(),
            "sync streaming"
        );

        self.stream(sink, stream, shutdown).await
    }

    /// Waits for the auth reply. `None` when shutdown was requested first.
    async fn await_auth(
        &mut self,
        stream: &mut WsSource,
        shutdown: &CancellationToken,
    ) -> Result<Option<(Option<Vec<PingTargetConfig>>, LastBuckets)>, SyncError> {
        let auth_timeout = self.config.auth_timeout;
        let deadline = tokio::time::sleep(auth_timeout);
        tokio::pin!(deadline);
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = &mut deadline => return Err(SyncError::AuthTimeout(auth_timeout)),
                msg = stream.next() => msg,
            };
            match msg {
                None | Some(Ok(Message::Close(_))) => return Err(SyncError::Closed),
                Some(Err(e)) => return Err(SyncError::Transport(e)),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(ServerMessage::Auth {
                            status: AuthStatus::Ok,
                            ping_targets,
                            last_buckets,
                            ..
                        }) => return Ok(Some((ping_targets, last_buckets))),
                        Ok(ServerMessage::Auth { message, .. }) => {
                            return Err(SyncError::AuthRejected(message.unwrap_or_default()));
                        }
                        Ok(other) => {
                            return Err(SyncError::Protocol(format!(
                                "expected auth reply, got {other:?}"
                            )));
                        }
                        Err(e) => return Err(SyncError::Protocol(e.to_string())),
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn stream(
        &mut self,
        mut sink: WsSink,
        mut stream: WsSource,
        shutdown: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut live_tick = interval(self.config.live_interval);
        live_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut batch_tick = interval(self.config.batch_interval);
        batch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut keepalive_tick = interval(self.config.keepalive_interval);
        keepalive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = timeout(WS_SEND_TIMEOUT, sink.send(Message::Close(None))).await;
                    return Ok(());
                }
                _ = live_tick.tick() => {
                    if self.deps.live.has_changed().unwrap_or(false) {
                        let sample = self.deps.live.borrow_and_update().clone();
                        if let Some(metrics) = sample {
                            send_json(&mut sink, &AgentMessage::Metrics { metrics }).await?;
                            bump(&self.deps.stats.live_sent, 1);
                        }
                    }
                }
                _ = batch_tick.tick() => {
                    if let Some(age) = self.outbox.in_flight_age(self.deps.clock.now())
                        && age > self.config.ack_timeout
                    {
                        return Err(SyncError::AckTimeout(age));
                    }
                    self.outbox.absorb(&self.deps.queue);
                    self.send_next_batch(&mut sink).await?;
                }
                _ = keepalive_tick.tick() => {
                    let now = self.deps.clock.now();
                    if let Some(since) = awaiting_pong
                        && now.saturating_duration_since(since) > self.config.keepalive_timeout
                    {
                        return Err(SyncError::KeepaliveMissed(self.config.keepalive_timeout));
                    }
                    send_message(&mut sink, Message::Ping(Bytes::new())).await?;
                    awaiting_pong.get_or_insert(now);
                }
                msg = stream.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => return Err(SyncError::Closed),
                    Some(Err(e)) => return Err(SyncError::Transport(e)),
                    Some(Ok(Message::Pong(_))) => awaiting_pong = None,
                    Some(Ok(Message::Text(text))) => {
                        self.handle_server_message(text.as_str(), &mut sink).await?;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn handle_server_message(
        &mut self,
        text: &str,
        sink: &mut WsSink,
    ) -> Result<(), SyncError> {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::BatchAck(ack)) => match self.outbox.ack(&ack) {
                Ok(sent) => {
                    bump(&self.deps.stats.batches_acked, 1);
                    bump(&self.deps.stats.buckets_accepted, ack.accepted as u64);
                    bump(&self.deps.stats.buckets_rejected, ack.rejected as u64);
                    tracing::debug!(
                        operation = "batch_ack",
                        batch_id = %ack.batch_id,
                        sent,
                        accepted = ack.accepted,
                        rejected = ack.rejected,
                        "batch acknowledged"
                    );
                    self.send_next_batch(sink).await?;
                }
                Err(e) => tracing::warn!(error = %e, "ignoring batch ack"),
            },
            Ok(ServerMessage::Config { ping_targets }) => self.deps.targets.set_custom(ping_targets),
            Ok(ServerMessage::Error { message }) => {
                tracing::warn!(message = %message, "server reported error");
            }
            Ok(ServerMessage::Auth { .. }) => tracing::debug!("ignoring auth reply while streaming"),
            Err(e) => tracing::warn!(error = %e, "unparseable server message"),
        }
        Ok(())
    }

    async fn send_next_batch(&mut self, sink: &mut WsSink) -> Result<(), SyncError> {
        let Some(mut batch) = self
            .outbox
            .next_batch(self.config.max_batch_buckets, self.deps.clock.now())
        else {
            return Ok(());
        };
        batch.last_metrics = self.deps.live.borrow().clone();
        let buckets = batch.bucket_count();
        let batch_id = batch.batch_id.clone();
        send_json(sink, &AgentMessage::AggregatedMetrics(batch)).await?;
        bump(&self.deps.stats.batches_sent, 1);
        tracing::debug!(
            operation = "send_batch",
            batch_id = %batch_id,
            buckets,
            "batch sent"
        );
        Ok(())
    }
}
