//! Wall-clock source used for credential freshness decisions.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in Unix epoch seconds.
pub trait Clock: Send + Sync {
    /// Current time (Unix epoch seconds).
    fn now_epoch_seconds(&self) -> i64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_else(|e| {
                tracing::warn!("System clock is before the Unix epoch: {e}");
                0
            })
    }
}
