// Connection state machine and reconnect backoff. All transitions take `now` explicitly.

use std::fmt;
use std::time::{Duration, Instant};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { retry_at: Instant },
    Connecting,
    Authenticating { deadline: Instant },
    Streaming { since: Instant },
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected { .. } => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating { .. } => "authenticating",
            ConnectionState::Streaming { .. } => "streaming",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {event} from {from}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

/// Why a connection ended; decides how the failure is logged and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Transport,
    AuthTimeout,
    AuthRejected,
    KeepaliveMissed,
    AckTimeout,
    Closed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisconnectReason::Transport => "transport",
            DisconnectReason::AuthTimeout => "auth_timeout",
            DisconnectReason::AuthRejected => "auth_rejected",
            DisconnectReason::KeepaliveMissed => "keepalive_missed",
            DisconnectReason::AckTimeout => "ack_timeout",
            DisconnectReason::Closed => "closed",
        })
    }
}

/// Doubling delay between initial and max.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay for this failure; the next call returns double, up to max.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay the next failure would get.
    pub fn peek(&self) -> Duration {
        self.current
    }
}

pub struct SyncStateMachine {
    state: ConnectionState,
    backoff: Backoff,
    auth_timeout: Duration,
    consecutive_auth_failures: u32,
}

impl SyncStateMachine {
    /// Starts disconnected with the retry timer already elapsed.
    pub fn new(backoff: Backoff, auth_timeout: Duration, now: Instant) -> Self {
        Self {
            state: ConnectionState::Disconnected { retry_at: now },
            backoff,
            auth_timeout,
            consecutive_auth_failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, ConnectionState::Streaming { .. })
    }

    pub fn consecutive_auth_failures(&self) -> u32 {
        self.consecutive_auth_failures
    }

    fn invalid(&self, event: &'static str) -> InvalidTransition {
        InvalidTransition {
            from: self.state.name(),
            event,
        }
    }

    /// Time left before a reconnect attempt is allowed; zero when not disconnected.
    pub fn retry_in(&self, now: Instant) -> Duration {
        match self.state {
            ConnectionState::Disconnected { retry_at } => retry_at.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    pub fn begin_connect(&mut self, now: Instant) -> Result<(), InvalidTransition> {
        match self.state {
            ConnectionState::Disconnected { retry_at } if now >= retry_at => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            _ => Err(self.invalid("begin_connect")),
        }
    }

    /// Transport is up; the auth deadline starts now.
    pub fn transport_established(&mut self, now: Instant) -> Result<Instant, InvalidTransition> {
        match self.state {
            ConnectionState::Connecting => {
                let deadline = now + self.auth_timeout;
                self.state = ConnectionState::Authenticating { deadline };
                Ok(deadline)
            }
            _ => Err(self.invalid("transport_established")),
        }
    }

    pub fn auth_accepted(&mut self, now: Instant) -> Result<(), InvalidTransition> {
        match self.state {
            ConnectionState::Authenticating { deadline } if now <= deadline => {
                self.state = ConnectionState::Streaming { since: now };
                self.consecutive_auth_failures = 0;
                Ok(())
            }
            _ => Err(self.invalid("auth_accepted")),
        }
    }

    /// True while authenticating past the deadline.
    pub fn auth_expired(&self, now: Instant) -> bool {
        matches!(self.state, ConnectionState::Authenticating { deadline } if now > deadline)
    }

    /// Moves to `Disconnected` from any state and returns the delay before the next attempt.
    /// Any time spent streaming resets the backoff first.
    pub fn disconnect(&mut self, now: Instant, reason: DisconnectReason) -> Duration {
        if matches!(self.state, ConnectionState::Streaming { .. }) {
            self.backoff.reset();
        }
        if reason == DisconnectReason::AuthRejected {
            self.consecutive_auth_failures += 1;
        }
        let delay = self.backoff.next_delay();
        self.state = ConnectionState::Disconnected {
            retry_at: now + delay,
        };
        delay
    }
}
