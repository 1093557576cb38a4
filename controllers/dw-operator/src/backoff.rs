//! # Fibonacci Backoff
//!
//! Requeue delays for objects whose reconciliation keeps failing. The delay
//! grows along the Fibonacci sequence from a floor to a cap, which backs off
//! more gently than doubling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Delay for an object that had already failed `failures` times in a row
/// before the current failure.
///
/// The first two retries wait `min`, then each delay is the sum of the
/// previous two, capped at `max`.
#[must_use]
pub fn fibonacci_delay(failures: u32, min: Duration, max: Duration) -> Duration {
    let (mut prev, mut current) = (min, min);
    for _ in 2..=failures {
        let next = prev.saturating_add(current);
        prev = current;
        current = next.min(max);
        if current >= max {
            break;
        }
    }
    current.min(max)
}

/// Per-object failure counts.
#[derive(Debug)]
pub struct FailureTracker {
    min: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns how long to wait before retrying.
    pub fn record_failure(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = fibonacci_delay(*count, self.min, self.max);
        *count = count.saturating_add(1);
        delay
    }

    /// Forgets the failure history of `key` after a clean reconcile.
    pub fn reset(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn test_fibonacci_delay_sequence() {
        let delays: Vec<u64> = (0..8).map(|n| fibonacci_delay(n, MIN, MAX).as_secs()).collect();
        // 5s, 5s, 10s, 15s, 25s, 40s, then capped at 60s
        assert_eq!(delays, vec![5, 5, 10, 15, 25, 40, 60, 60]);
    }

    #[test]
    fn test_tracker_counts_per_key() {
        let tracker = FailureTracker::new(MIN, MAX);
        assert_eq!(tracker.record_failure("ops/a"), Duration::from_secs(5));
        assert_eq!(tracker.record_failure("ops/a"), Duration::from_secs(5));
        assert_eq!(tracker.record_failure("ops/a"), Duration::from_secs(10));
        assert_eq!(tracker.record_failure("ops/b"), Duration::from_secs(5));

        tracker.reset("ops/a");
        assert_eq!(tracker.record_failure("ops/a"), Duration::from_secs(5));
    }
}
