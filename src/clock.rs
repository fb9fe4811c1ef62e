// Time source for timers and bucket validation; swapped out in tests

use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + 'static {
    /// Monotonic time for deadlines and backoff.
    fn now(&self) -> Instant;

    /// Wall-clock unix seconds for bucket indexing.
    fn unix_now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    /// Read through tokio so deadlines line up with tokio timers, paused time included.
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn unix_now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, operation = "unix_now", "system time error");
                0
            })
    }
}
