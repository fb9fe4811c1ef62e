// WebSocket handlers: agent ingestion sessions and dashboard live fanout

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, timeout};

use super::AppState;
use crate::config::IngestConfig;
use crate::ingest::{IngestService, SessionHandle};
use crate::protocol::{AgentMessage, DashboardMessage, LiveUpdate, ServerMessage};

pub(super) const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub(super) const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Decrements the dashboard connection count on drop (connect = +1, drop = -1).
struct WsDashboardGuard(Arc<AtomicUsize>);

impl Drop for WsDashboardGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct AgentTiming {
    auth_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

impl From<&IngestConfig> for AgentTiming {
    fn from(c: &IngestConfig) -> Self {
        Self {
            auth_timeout: Duration::from_secs(c.auth_timeout_secs),
            keepalive_interval: Duration::from_secs(c.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(c.keepalive_timeout_secs),
        }
    }
}

async fn send_json(socket: &mut WebSocket, msg: &impl Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(json.into())))
        .await
        .map_err(|_| anyhow::anyhow!("send timed out"))??;
    Ok(())
}

async fn close(socket: &mut WebSocket) {
    let _ = timeout(WS_SEND_TIMEOUT, socket.send(Message::Close(None))).await;
}

pub(super) async fn ws_agent(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let ingest = state.ingest.clone();
    let timing = AgentTiming::from(&state.config.ingest);
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = agent_session(socket, ingest, timing).await {
            tracing::info!("Agent session error: {}", e);
        }
    })
}

struct AuthRequest {
    server_id: String,
    token: String,
    version: String,
}

/// Waits for the first `auth` frame. `None` means the socket was already answered and closed.
async fn await_auth(
    socket: &mut WebSocket,
    auth_timeout: Duration,
) -> anyhow::Result<Option<AuthRequest>> {
    let deadline = Instant::now() + auth_timeout;
    loop {
        let msg = match tokio::time::timeout_at(deadline, socket.recv()).await {
            Ok(msg) => msg,
            Err(_) => {
                send_json(socket, &ServerMessage::auth_error("Authentication timeout")).await?;
                close(socket).await;
                return Ok(None);
            }
        };
        match msg {
            None | Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentMessage>(text.as_str()) {
                Ok(AgentMessage::Auth {
                    server_id,
                    token,
                    version,
                }) => {
                    return Ok(Some(AuthRequest {
                        server_id,
                        token,
                        version,
                    }));
                }
                _ => {
                    send_json(socket, &ServerMessage::auth_error("Not authenticated")).await?;
                    close(socket).await;
                    return Ok(None);
                }
            },
            Some(Ok(_)) => {}
        }
    }
}

async fn agent_session(
    mut socket: WebSocket,
    ingest: Arc<IngestService>,
    timing: AgentTiming,
) -> anyhow::Result<()> {
    let Some(request) = await_auth(&mut socket, timing.auth_timeout).await? else {
        return Ok(());
    };
    let identity = match ingest.check_credentials(&request.server_id, &request.token) {
        Ok(identity) => identity,
        Err(e) => {
            send_json(&mut socket, &ServerMessage::auth_error(e.to_string())).await?;
            close(&mut socket).await;
            return Ok(());
        }
    };

    let (handle, reply) = ingest.open_session(&identity, &request.version).await?;
    let result = match send_json(&mut socket, &reply).await {
        Ok(()) => serve_agent(&mut socket, &ingest, &identity.server_id, &handle, timing).await,
        Err(e) => Err(e),
    };
    ingest.close_session(&identity.server_id, handle.session_id);
    result
}

async fn serve_agent(
    socket: &mut WebSocket,
    ingest: &IngestService,
    server_id: &str,
    handle: &SessionHandle,
    timing: AgentTiming,
) -> anyhow::Result<()> {
    let mut ping_interval = tokio::time::interval_at(
        Instant::now() + timing.keepalive_interval,
        timing.keepalive_interval,
    );
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                tracing::info!(server_id, session_id = handle.session_id, "session cancelled");
                close(socket).await;
                return Ok(());
            }
            _ = ping_interval.tick() => {
                if last_heard.elapsed() > timing.keepalive_timeout {
                    tracing::warn!(server_id, "agent missed keepalive; closing");
                    close(socket).await;
                    return Ok(());
                }
                let r = timeout(WS_SEND_TIMEOUT, socket.send(Message::Ping(Bytes::new()))).await;
                if !matches!(r, Ok(Ok(()))) {
                    return Ok(());
                }
            }
            msg = socket.recv() => {
                let msg = match msg {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(msg)) => msg,
                };
                last_heard = Instant::now();
                match msg {
                    Message::Text(text) => {
                        handle_agent_text(socket, ingest, server_id, handle.session_id, text.as_str()).await?;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

async fn handle_agent_text(
    socket: &mut WebSocket,
    ingest: &IngestService,
    server_id: &str,
    session_id: u64,
    text: &str,
) -> anyhow::Result<()> {
    match serde_json::from_str::<AgentMessage>(text) {
        Ok(AgentMessage::Metrics { metrics }) => ingest.record_live(server_id, metrics),
        Ok(AgentMessage::AggregatedMetrics(batch)) => {
            match ingest.ingest_batch(server_id, session_id, &batch).await {
                Ok(ack) => send_json(socket, &ServerMessage::BatchAck(ack)).await?,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        server_id,
                        batch_id = %batch.batch_id,
                        operation = "ingest_batch",
                        "batch not stored"
                    );
                    let msg = ServerMessage::Error {
                        message: format!("batch {} not stored", batch.batch_id),
                    };
                    send_json(socket, &msg).await?;
                }
            }
        }
        Ok(AgentMessage::Auth { .. }) => {
            tracing::debug!(server_id, "ignoring repeated auth");
        }
        Err(e) => {
            tracing::debug!(server_id, error = %e, "undecodable agent message");
            let msg = ServerMessage::Error {
                message: format!("invalid message: {}", e),
            };
            send_json(socket, &msg).await?;
        }
    }
    Ok(())
}

pub(super) async fn ws_dashboard(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let ingest = state.ingest.clone();
    let conn_count = state.dashboard_connections.clone();
    ws.on_upgrade(move |socket| async move {
        let mut rx = ingest.subscribe();
        if let Err(e) = stream_dashboard(socket, &mut rx, conn_count, &ingest).await {
            tracing::info!("Dashboard stream error: {}", e);
        }
    })
}

async fn stream_dashboard(
    mut socket: WebSocket,
    rx: &mut broadcast::Receiver<LiveUpdate>,
    conn_count: Arc<AtomicUsize>,
    ingest: &IngestService,
) -> anyhow::Result<()> {
    conn_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let _guard = WsDashboardGuard(conn_count);
    tracing::info!("Client connected to dashboard stream");

    let snapshot = DashboardMessage::Snapshot {
        agents: ingest.sessions().latest_all(),
    };
    if send_json(&mut socket, &snapshot).await.is_err() {
        return Ok(());
    }

    let mut ping_interval =
        tokio::time::interval_at(Instant::now() + WS_PING_INTERVAL, WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(update) => {
                        if send_json(&mut socket, &DashboardMessage::Metrics(update)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket /ws/dashboard client lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                let r = timeout(WS_SEND_TIMEOUT, socket.send(Message::Ping(Bytes::new()))).await;
                if !matches!(r, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
    Ok(())
}
