// Agent identities: who may connect, with which token, and which ping targets they get

use std::collections::HashMap;

use crate::config::{AgentEntry, AppConfig};
use crate::models::PingTargetConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub server_id: String,
    pub token: String,
    pub ping_targets: Vec<PingTargetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Server not found")]
    UnknownServer,
    #[error("Invalid token")]
    InvalidToken,
}

pub trait IdentityProvider: Send + Sync {
    fn lookup(&self, server_id: &str) -> Option<AgentIdentity>;

    /// Checks the credential pair and returns the identity it belongs to.
    fn authenticate(&self, server_id: &str, token: &str) -> Result<AgentIdentity, AuthError> {
        if server_id.is_empty() || token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let identity = self.lookup(server_id).ok_or(AuthError::UnknownServer)?;
        if !constant_time_eq(identity.token.as_bytes(), token.as_bytes()) {
            return Err(AuthError::InvalidToken);
        }
        Ok(identity)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Identities listed under `[[agents]]`, each given the global probe targets followed by its own.
pub struct StaticIdentities {
    agents: HashMap<String, AgentIdentity>,
}

impl StaticIdentities {
    pub fn new(entries: &[AgentEntry], global_targets: &[PingTargetConfig]) -> Self {
        let agents = entries
            .iter()
            .map(|e| {
                let mut ping_targets = global_targets.to_vec();
                ping_targets.extend(e.ping_targets.iter().cloned());
                (
                    e.server_id.clone(),
                    AgentIdentity {
                        server_id: e.server_id.clone(),
                        token: e.token.clone(),
                        ping_targets,
                    },
                )
            })
            .collect();
        Self { agents }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.agents, &config.probe.ping_targets)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl IdentityProvider for StaticIdentities {
    fn lookup(&self, server_id: &str) -> Option<AgentIdentity> {
        self.agents.get(server_id).cloned()
    }
}
