//! Conflict policy for optimistic transactions
//!
//! Commit validates every document and query a transaction read. If any of
//! them moved, nothing is written and the closure runs again against fresh
//! state, after a short pause that doubles with each conflict. Errors
//! raised by the closure itself end the transaction at once.
//!
//! The default budget of five attempts matches what hosted document stores
//! give their transactions, so aggregation code sees the same failure rate
//! under contention.

use std::time::Duration;

/// How often and how patiently `run_transaction` re-runs on conflict.
///
/// ```ignore
/// let store = MemoryStore::new().with_retry(RetryConfig::single_attempt());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts before a conflict is reported, at least 1
    pub attempts: usize,
    /// Pause after the first conflict
    pub backoff: Duration,
    /// Longest pause between attempts
    pub backoff_cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(2),
            backoff_cap: Duration::from_millis(50),
        }
    }
}

impl RetryConfig {
    /// Five attempts with a 2ms pause doubling up to 50ms
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the first conflict.
    pub fn single_attempt() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    /// Allow `attempts` commits; 0 is treated as 1.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Pause after the first conflict; later pauses double from it.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Pause before re-running after conflict number `conflicts` (1-based),
    /// or `None` once the attempt budget is spent.
    pub fn next_backoff(&self, conflicts: usize) -> Option<Duration> {
        if conflicts >= self.attempts {
            return None;
        }
        let doubling = u32::try_from(conflicts.saturating_sub(1)).unwrap_or(u32::MAX);
        let pause = self
            .backoff
            .checked_mul(2u32.saturating_pow(doubling))
            .unwrap_or(self.backoff_cap);
        Some(pause.min(self.backoff_cap))
    }
}
