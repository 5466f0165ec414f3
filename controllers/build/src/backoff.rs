//! # Fibonacci Backoff
//!
//! Per-pool backoff for reconcile errors. Delays follow the Fibonacci sequence
//! (min, min, 2min, 3min, 5min, ...) capped at a maximum, and reset once the
//! pool reconciles cleanly.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibonacciBackoff {
    min: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min` and capped at `max`
    #[must_use]
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay after `error_count` consecutive errors (1-based; 0 is treated as 1)
    #[must_use]
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let mut prev = Duration::ZERO;
        let mut current = self.min;
        for _ in 1..error_count.max(1) {
            let next = prev.saturating_add(current);
            prev = current;
            current = next.min(self.max);
            if current >= self.max {
                break;
            }
        }
        current.min(self.max)
    }
}

/// Consecutive error counts per key, turned into Fibonacci delays
#[derive(Debug)]
pub struct ErrorBackoff {
    backoff: FibonacciBackoff,
    error_counts: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    /// Track errors with the given backoff curve
    #[must_use]
    pub fn new(backoff: FibonacciBackoff) -> Self {
        Self {
            backoff,
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Record an error for `key` and return how long to wait before retrying
    pub fn record_error(&self, key: &str) -> Duration {
        let mut counts = self.error_counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        self.backoff.delay_for(*count)
    }

    /// Forget the errors recorded for `key`
    pub fn reset(&self, key: &str) {
        self.error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new(FibonacciBackoff::new(Duration::from_secs(5), Duration::from_secs(300)))
    }
}
