// Per-identity sessions and the latest-state cache behind the live dashboard

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::protocol::{LastBuckets, LiveUpdate};

struct AgentSession {
    session_id: u64,
    connected_at: i64,
    version: String,
    last_buckets: LastBuckets,
    batches: u64,
    buckets_accepted: u64,
    buckets_rejected: u64,
    cancel: CancellationToken,
}

/// Returned to the connection task that owns a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    /// Cancelled when an admin disconnects the identity or a newer connection replaces it.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub server_id: String,
    pub session_id: u64,
    pub connected_at: i64,
    pub version: String,
    pub batches: u64,
    pub buckets_accepted: u64,
    pub buckets_rejected: u64,
    pub last_buckets: LastBuckets,
    pub last_live_at: Option<i64>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, AgentSession>>,
    latest: RwLock<HashMap<String, LiveUpdate>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly authenticated connection. An older session of the same identity
    /// is cancelled and replaced.
    pub fn open(
        &self,
        server_id: &str,
        version: &str,
        last_buckets: LastBuckets,
        now: i64,
    ) -> SessionHandle {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let session = AgentSession {
            session_id,
            connected_at: now,
            version: version.to_string(),
            last_buckets,
            batches: 0,
            buckets_accepted: 0,
            buckets_rejected: 0,
            cancel: cancel.clone(),
        };
        let previous = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.to_string(), session);
        if let Some(previous) = previous {
            tracing::info!(
                server_id,
                replaced_session = previous.session_id,
                session_id,
                "agent reconnected; closing previous session"
            );
            previous.cancel.cancel();
        }
        SessionHandle { session_id, cancel }
    }

    /// Removes the session if it is still the current one for `server_id`.
    pub fn close(&self, server_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(server_id)
            .is_some_and(|s| s.session_id == session_id)
        {
            sessions.remove(server_id);
            return true;
        }
        false
    }

    /// Admin disconnect: cancels only this identity's session.
    pub fn disconnect(&self, server_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(server_id) {
            Some(s) => {
                s.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn record_batch(
        &self,
        server_id: &str,
        session_id: u64,
        accepted: usize,
        rejected: usize,
        last_buckets: &LastBuckets,
    ) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(s) = sessions
            .get_mut(server_id)
            .filter(|s| s.session_id == session_id)
        {
            s.batches += 1;
            s.buckets_accepted += accepted as u64;
            s.buckets_rejected += rejected as u64;
            s.last_buckets = last_buckets.clone();
        }
    }

    pub fn update_live(&self, update: LiveUpdate) {
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(update.server_id.clone(), update);
    }

    pub fn latest(&self, server_id: &str) -> Option<LiveUpdate> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
    }

    /// Latest live sample of every agent ever seen by this process, ordered by server id.
    pub fn latest_all(&self) -> Vec<LiveUpdate> {
        let mut all: Vec<LiveUpdate> = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    pub fn connected(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<SessionSummary> = sessions
            .iter()
            .map(|(server_id, s)| SessionSummary {
                server_id: server_id.clone(),
                session_id: s.session_id,
                connected_at: s.connected_at,
                version: s.version.clone(),
                batches: s.batches,
                buckets_accepted: s.buckets_accepted,
                buckets_rejected: s.buckets_rejected,
                last_buckets: s.last_buckets.clone(),
                last_live_at: latest.get(server_id).map(|u| u.received_at),
            })
            .collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }
}
