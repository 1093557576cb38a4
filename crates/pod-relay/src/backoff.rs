//! # Per-Key Exponential Backoff
//!
//! Provides the retry delays used by the rate-limited queue.
//! Each key tracks its own failure count, so one object that keeps failing
//! backs off without slowing down retries for anything else.
//!
//! Sequence with the defaults: 5ms, 10ms, 20ms, 40ms, ... doubling until the
//! 1000s ceiling, then staying there until the key is forgotten.

use std::collections::HashMap;
use std::time::Duration;

/// Default delay for the first retry of a key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for a single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff calculator
///
/// `when()` records a failure for the key and returns how long to wait before
/// retrying it. `forget()` clears the key after a success.
#[derive(Debug, Clone)]
pub struct ItemExponentialBackoff {
    /// Delay for the first failure
    base: Duration,
    /// Maximum delay for any failure
    max: Duration,
    /// Consecutive failures per key
    failures: HashMap<String, u32>,
}

impl ItemExponentialBackoff {
    /// Create a new backoff with the given base and maximum delays
    ///
    /// # Arguments
    ///
    /// * `base` - Delay returned for the first failure of a key
    /// * `max` - Cap on the delay, however many times the key failed
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Records a failure for `key` and returns the delay before its next retry
    pub fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = Self::calculate_for_failure_count(*failures, self.base, self.max);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Number of failures recorded for `key` since it was last forgotten
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the backoff for `key` after it was processed successfully
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Calculate the delay for a given failure count (stateless)
    ///
    /// Returns `base * 2^failure_count`, capped at `max`. Overflow of the
    /// exponent also yields `max`.
    #[must_use]
    pub fn calculate_for_failure_count(failure_count: u32, base: Duration, max: Duration) -> Duration {
        let factor = match 2u32.checked_pow(failure_count) {
            Some(f) => f,
            None => return max,
        };
        match base.checked_mul(factor) {
            Some(delay) if delay < max => delay,
            _ => max,
        }
    }
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ItemExponentialBackoff::default();

        assert_eq!(backoff.when("default/web-1"), Duration::from_millis(5));
        assert_eq!(backoff.when("default/web-1"), Duration::from_millis(10));
        assert_eq!(backoff.when("default/web-1"), Duration::from_millis(20));
        assert_eq!(backoff.when("default/web-1"), Duration::from_millis(40));
        assert_eq!(backoff.num_requeues("default/web-1"), 4);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.when("k"), Duration::from_secs(1));
        assert_eq!(backoff.when("k"), Duration::from_secs(2));
        assert_eq!(backoff.when("k"), Duration::from_secs(4));
        assert_eq!(backoff.when("k"), Duration::from_secs(8));
        // 16s would exceed the ceiling
        assert_eq!(backoff.when("k"), Duration::from_secs(10));
        assert_eq!(backoff.when("k"), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_huge_count_is_capped() {
        let delay = ItemExponentialBackoff::calculate_for_failure_count(
            200,
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        );
        assert_eq!(delay, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_exponential_backoff_keys_are_independent() {
        let mut backoff = ItemExponentialBackoff::default();

        backoff.when("a");
        backoff.when("a");
        backoff.when("a");

        // "b" starts from the base delay regardless of "a"
        assert_eq!(backoff.when("b"), Duration::from_millis(5));
        assert_eq!(backoff.num_requeues("a"), 3);
        assert_eq!(backoff.num_requeues("b"), 1);
    }

    #[test]
    fn test_exponential_backoff_forget() {
        let mut backoff = ItemExponentialBackoff::default();

        backoff.when("k");
        backoff.when("k");
        backoff.forget("k");

        // Should restart from the base delay after success
        assert_eq!(backoff.num_requeues("k"), 0);
        assert_eq!(backoff.when("k"), Duration::from_millis(5));
    }
}
