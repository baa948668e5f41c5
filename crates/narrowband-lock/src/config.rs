//! Lock timing configuration.

use std::time::Duration;

/// Timing knobs for [`GameLocks`](crate::GameLocks).
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How often a waiting acquire re-tries.
    pub poll_interval: Duration,
    /// Longest an unbounded acquire may wait before it is reported as a
    /// deadlock.
    pub deadlock_ceiling: Duration,
    /// Upper bound for a caller-supplied wait. Larger waits are clamped;
    /// callers that can afford to wait longer should wait unbounded.
    pub max_bounded_wait: Duration,
    /// Holders older than this are called out in holder dumps.
    pub long_hold_warning: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            deadlock_ceiling: Duration::from_secs(60),
            max_bounded_wait: Duration::from_secs(1),
            long_hold_warning: Duration::from_secs(60),
        }
    }
}

impl LockConfig {
    /// Keeps the values usable: a non-zero poll interval, and a ceiling
    /// no shorter than the longest bounded wait.
    pub fn validated(mut self) -> Self {
        if self.poll_interval.is_zero() {
            tracing::warn!("poll_interval of 0, using 1ms");
            self.poll_interval = Duration::from_millis(1);
        }
        if self.deadlock_ceiling < self.max_bounded_wait {
            self.deadlock_ceiling = self.max_bounded_wait;
        }
        self
    }
}
